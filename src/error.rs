use std::fmt;
use thiserror::Error;

/// Erreurs du pipeline d'extraction et d'entraînement
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Colonne obligatoire absente de l'en-tête (fatal au chargement)
    #[error("colonne obligatoire absente: {0}")]
    MissingColumn(String),

    /// Aucune ligne valide après normalisation
    #[error("jeu de données vide: aucune ligne valide ({rejected} ligne(s) rejetée(s))")]
    EmptyDataset { rejected: usize },

    /// Dépendance d'un analyseur indisponible, l'étape continue en mode dégradé
    #[error("analyseur {stage} dégradé: {reason}")]
    AnalyzerDegraded { stage: String, reason: String },

    /// Échec d'une étape en mode strict
    #[error("échec de l'analyseur {stage} (mode strict): {reason}")]
    AnalyzerHardFailure { stage: String, reason: String },

    /// Incohérence de la jointure, ne doit jamais arriver sur une entrée valide
    #[error("invariant d'agrégation violé: {0}")]
    AggregationInvariant(String),

    /// Préconditions d'entraînement non remplies
    #[error("précondition d'entraînement non remplie: {0}")]
    TrainingPrecondition(String),

    #[error("liste de réputation indisponible: {0}")]
    ThreatList(String),

    /// Tâche bloquante interrompue (panique ou annulation)
    #[error("tâche {stage} interrompue: {reason}")]
    Task { stage: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Raison du rejet d'une ligne au chargement
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowRejection {
    MissingField(&'static str),
    InvalidValue { field: &'static str, value: String },
    InvalidIp(String),
    UnsortedTimestamps,
    EndBeforeStart,
    DuplicateFlowId(String),
    Malformed(String),
}

impl RowRejection {
    /// Clé de regroupement pour le comptage par raison
    pub fn reason_key(&self) -> String {
        match self {
            Self::MissingField(field) => format!("missing_{}", field),
            Self::InvalidValue { field, .. } => format!("invalid_{}", field),
            Self::InvalidIp(_) => "invalid_ip".to_string(),
            Self::UnsortedTimestamps => "unsorted_timestamps".to_string(),
            Self::EndBeforeStart => "end_before_start".to_string(),
            Self::DuplicateFlowId(_) => "duplicate_flow_id".to_string(),
            Self::Malformed(_) => "malformed_row".to_string(),
        }
    }
}

impl fmt::Display for RowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "champ obligatoire vide: {}", field),
            Self::InvalidValue { field, value } => {
                write!(f, "valeur invalide pour {}: '{}'", field, value)
            }
            Self::InvalidIp(value) => write!(f, "adresse IP invalide: '{}'", value),
            Self::UnsortedTimestamps => write!(f, "horodatages de paquets non croissants"),
            Self::EndBeforeStart => write!(f, "end_time antérieur à start_time"),
            Self::DuplicateFlowId(id) => write!(f, "flow_id en double: {}", id),
            Self::Malformed(reason) => write!(f, "ligne CSV illisible: {}", reason),
        }
    }
}
