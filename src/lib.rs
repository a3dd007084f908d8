//! Bibliothèque vpnlens pour la détection de trafic VPN
//!
//! Cette bibliothèque transforme des flux réseau bruts en une table de
//! caractéristiques prête pour l'apprentissage : statistiques de flux,
//! réputation des extrémités, motifs temporels, distribution des tailles et
//! empreintes TLS, jointes par `flow_id`.
//!
//! Elle entraîne ensuite un classifieur supervisé et un détecteur d'anomalies
//! sur cette table.

// Modules principaux
pub mod models; // Structures de données et modèles
pub mod config; // Configuration du système
pub mod error; // Taxonomie des erreurs
pub mod logger; // Journal d'exécution
pub mod log_mode; // Modes de journalisation

// Chaîne de traitement
pub mod loader; // Chargement et normalisation des flux
pub mod analyzer; // Analyseurs par flux
pub mod aggregator; // Jointure des caractéristiques
pub mod trainer; // Classifieur et détecteur d'anomalies
pub mod pipeline; // Orchestration des étapes

pub mod cli; // Interface en ligne de commande

// Re-export des structures principales pour faciliter l'utilisation
pub use aggregator::{AggregatedTable, Aggregator};
pub use config::{Config, FailureMode};
pub use error::{PipelineError, Result};
pub use log_mode::LogMode;
pub use models::{FlowRecord, Label, Report, ReportType};
pub use pipeline::{FeaturePipeline, PipelineOutcome, StageState, StageStatus};
pub use trainer::{Trainer, TrainingOutcome};
