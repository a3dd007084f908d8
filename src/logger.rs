use crate::log_mode::LogMode;
use crate::models::{Report, ReportType};
use crate::pipeline::{StageState, StageStatus};
use chrono::{DateTime, Local};
use log::{error, info, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

/// Journal d'exécution du pipeline
pub struct Logger {
    log_file: Mutex<Option<File>>,
    log_path: String,
    log_mode: LogMode,
}

impl Logger {
    pub fn new(log_path: String) -> Self {
        Self::new_with_mode(log_path, LogMode::File)
    }

    pub fn new_with_mode(log_path: String, log_mode: LogMode) -> Self {
        let file = if log_mode == LogMode::File {
            // Créer le répertoire si nécessaire
            if let Some(parent) = Path::new(&log_path).parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Erreur lors de la création du répertoire de logs: {}", e);
                }
            }

            match OpenOptions::new().create(true).append(true).open(&log_path) {
                Ok(file) => Some(file),
                Err(e) => {
                    error!("Erreur lors de l'ouverture du fichier de log {}: {}", log_path, e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            log_file: Mutex::new(file),
            log_path,
            log_mode,
        }
    }

    fn format_time(time: SystemTime) -> String {
        let timestamp: DateTime<Local> = time.into();
        timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    pub fn log_report(&self, report: &Report) {
        let report_type = match report.report_type {
            ReportType::Info => "INFO",
            ReportType::Warning => "WARNING",
            ReportType::Degraded => "DEGRADED",
            ReportType::Failure => "FAILURE",
        };

        let mut log_entry = format!(
            "[{}] [{}] [{}] {}",
            Self::format_time(report.timestamp),
            report_type,
            report.stage,
            report.message
        );
        if let Some(details) = &report.details {
            log_entry.push_str(&format!(" ({})", details));
        }

        match self.log_mode {
            LogMode::File => self.write_to_log(&format!("{}\n", log_entry)),
            LogMode::Console => match report.report_type {
                ReportType::Info => info!("{}", log_entry),
                ReportType::Warning | ReportType::Degraded => warn!("{}", log_entry),
                ReportType::Failure => error!("{}", log_entry),
            },
        }
    }

    pub fn log_stage(&self, status: &StageStatus) {
        let log_entry = format!(
            "[{}] [STAGE] {} -> {} en {} ms",
            Self::format_time(SystemTime::now()),
            status.stage,
            status.state,
            status.elapsed_ms
        );

        match self.log_mode {
            LogMode::File => self.write_to_log(&format!("{}\n", log_entry)),
            LogMode::Console => match status.state {
                StageState::Completed => info!("{}", log_entry),
                _ => warn!("{}", log_entry),
            },
        }
    }

    fn write_to_log(&self, message: &str) {
        if self.log_mode != LogMode::File {
            return;
        }

        let mut log_file_guard = match self.log_file.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("Erreur lors de l'acquisition du verrou pour le fichier de log: {}", e);
                return;
            }
        };

        if let Some(file) = log_file_guard.as_mut() {
            if let Err(e) = file.write_all(message.as_bytes()) {
                error!("Erreur lors de l'écriture dans le fichier de log: {}", e);

                // Essayer de réouvrir le fichier
                *log_file_guard = match OpenOptions::new().create(true).append(true).open(&self.log_path) {
                    Ok(file) => Some(file),
                    Err(e) => {
                        error!("Erreur lors de la réouverture du fichier de log: {}", e);
                        None
                    }
                };
            }
        }
    }
}
