use crate::log_mode::LogMode;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "vpnlens.json";

/// Politique face à l'échec d'une étape
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// L'étape défaillante est marquée indisponible et ses sentinelles sont utilisées
    Soft,
    /// Toute défaillance d'étape interrompt l'exécution
    Hard,
}

impl Default for FailureMode {
    fn default() -> Self {
        FailureMode::Soft
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Niveau de log
    pub log_level: String,

    /// Mode de journalisation (fichier ou console)
    pub log_mode: LogMode,

    /// Chemin du journal d'exécution
    pub journal_file: String,

    /// Répertoire des artefacts (résumés, table ML, modèles)
    pub output_dir: PathBuf,

    pub failure_mode: FailureMode,

    /// Délai maximal (en secondes) d'une étape avant qu'elle soit marquée indisponible
    pub stage_timeout_secs: u64,

    pub flow_stats: FlowStatsConfig,
    pub reputation: ReputationConfig,
    pub temporal: TemporalConfig,
    pub size: SizeConfig,
    pub aggregator: AggregatorConfig,
    pub trainer: TrainerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FlowStatsConfig {
    /// Nombre de ports de destination retenus dans le résumé global
    pub top_n_ports: usize,
}

impl Default for FlowStatsConfig {
    fn default() -> Self {
        Self { top_n_ports: 5 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReputationConfig {
    /// Liste de référence (ip, cidr ou domaine + catégorie par ligne)
    pub threat_list_path: Option<PathBuf>,
    /// Score attribué aux extrémités sans correspondance
    pub neutral_score: f64,
    pub vpn_weight: f64,
    pub malicious_weight: f64,
    pub trusted_weight: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            threat_list_path: None,
            neutral_score: 0.5,
            vpn_weight: 0.3,
            malicious_weight: 0.5,
            trusted_weight: 0.4,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TemporalConfig {
    /// Nombre de classes (échelle logarithmique) de l'histogramme d'entropie
    pub entropy_bins: usize,
    /// Fraction de l'inter-arrivée moyenne sous laquelle un écart compte comme rafale
    pub burst_fraction: f64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            entropy_bins: 10,
            burst_fraction: 0.1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SizeConfig {
    /// Seuil en octets des petits paquets
    pub small_packet_threshold: u32,
    /// Bornes de la plage proche MTU, typique des tunnels
    pub mtu_low: u32,
    pub mtu_high: u32,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            small_packet_threshold: 64,
            mtu_low: 1400,
            mtu_high: 1500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Normalisation min-max des colonnes continues
    pub normalize: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TrainerConfig {
    pub seed: u64,
    /// Part de la partition de test
    pub test_fraction: f64,
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    /// Proportion attendue d'anomalies
    pub contamination: f64,
    pub isolation_trees: usize,
    pub isolation_sample_size: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            test_fraction: 0.2,
            n_trees: 100,
            max_depth: 16,
            min_samples_split: 2,
            contamination: 0.1,
            isolation_trees: 100,
            isolation_sample_size: 256,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            log_mode: LogMode::Console,
            journal_file: "results/vpnlens.log".to_string(),
            output_dir: PathBuf::from("results"),
            failure_mode: FailureMode::Soft,
            stage_timeout_secs: 300,
            flow_stats: FlowStatsConfig::default(),
            reputation: ReputationConfig::default(),
            temporal: TemporalConfig::default(),
            size: SizeConfig::default(),
            aggregator: AggregatorConfig::default(),
            trainer: TrainerConfig::default(),
        }
    }
}

impl Config {
    /// Charge la configuration depuis le fichier, ou les valeurs par défaut s'il n'existe pas
    pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_content)?;

        Ok(config)
    }

    /// Sauvegarde la configuration dans le fichier
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn Error>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let config_json = serde_json::to_string_pretty(self)?;
        fs::write(path, config_json)?;

        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs.max(1))
    }

    pub fn is_strict(&self) -> bool {
        self.failure_mode == FailureMode::Hard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.failure_mode, FailureMode::Soft);
        assert_eq!(config.temporal.entropy_bins, 10);
        assert_eq!(config.reputation.neutral_score, 0.5);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf/vpnlens.json");

        let mut config = Config::default();
        config.failure_mode = FailureMode::Hard;
        config.trainer.seed = 7;
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert!(reloaded.is_strict());
        assert_eq!(reloaded.trainer.seed, 7);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"size": {"small_packet_threshold": 100}}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.size.small_packet_threshold, 100);
        assert_eq!(config.size.mtu_high, 1500);
        assert_eq!(config.trainer.test_fraction, 0.2);
    }
}
