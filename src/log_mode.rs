use serde::{Deserialize, Serialize};

/// Destination du journal d'exécution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    /// Journal dans un fichier local, en plus des logs standards
    File,
    /// Uniquement via le crate log (stderr)
    Console,
}

impl Default for LogMode {
    fn default() -> Self {
        LogMode::Console
    }
}
