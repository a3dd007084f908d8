//! Orchestration du pipeline : chargement, analyses parallèles, agrégation, entraînement
//!
//! Les analyseurs lisent le même ensemble de flux immuable et tournent chacun
//! sur une tâche bloquante bornée par le délai d'étape. L'agrégateur attend
//! que toutes les étapes soient terminées ou marquées indisponibles.

use crate::aggregator::{AggregatedTable, Aggregator, GroupContribution};
use crate::analyzer::reputation::FileThreatList;
use crate::analyzer::{
    FlowAnalyzer, FlowStatsAnalyzer, ReputationScorer, SizeAnalyzer, TemporalAnalyzer, ThreatListSource, TlsAnalyzer,
};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::loader::{self, LoadReport, LoadedFlows};
use crate::logger::Logger;
use crate::models::{AnalyzerOutput, AnalyzerSummary, Report, ReportType};
use crate::trainer::{joined, Trainer, TrainingOutcome};
use futures::future::join_all;
use log::{error, info, warn};
use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const ML_TABLE_FILE: &str = "flows_ml_ready.csv";
pub const RUN_SUMMARY_FILE: &str = "pipeline_summary.json";

/// État final d'une étape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Completed,
    /// Étape terminée en mode dégradé (ex: réputation neutre)
    Degraded,
    Failed,
    TimedOut,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub state: StageState,
    pub elapsed_ms: u64,
    pub reason: Option<String>,
}

impl StageStatus {
    pub fn new(stage: &str, state: StageState, elapsed: Duration) -> Self {
        Self {
            stage: stage.to_string(),
            state,
            elapsed_ms: elapsed.as_millis() as u64,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: String) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Les contributions de l'étape sont-elles utilisables
    pub fn is_usable(&self) -> bool {
        matches!(self.state, StageState::Completed | StageState::Degraded)
    }
}

/// Résultat complet d'une exécution
#[derive(Debug)]
pub struct PipelineOutcome {
    pub load_report: LoadReport,
    pub stages: Vec<StageStatus>,
    pub summaries: Vec<AnalyzerSummary>,
    pub table: Arc<AggregatedTable>,
    pub table_path: PathBuf,
    pub training: Option<TrainingOutcome>,
    pub reports: Vec<Report>,
}

impl PipelineOutcome {
    pub fn stage(&self, name: &str) -> Option<&StageStatus> {
        self.stages.iter().find(|s| s.stage == name)
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    load: &'a LoadReport,
    stages: &'a [StageStatus],
    rows: usize,
    columns: usize,
    aggregation: &'a crate::aggregator::AggregationReport,
}

/// Résultat brut d'un analyseur lancé sous délai
type StageResult = std::result::Result<std::result::Result<Result<AnalyzerOutput>, tokio::task::JoinError>, tokio::time::error::Elapsed>;

pub struct FeaturePipeline {
    config: Config,
    threat_source: Option<Arc<dyn ThreatListSource>>,
    overrides: Vec<Arc<dyn FlowAnalyzer>>,
    logger: Arc<Logger>,
}

impl FeaturePipeline {
    pub fn new(config: Config) -> Self {
        let threat_source = config
            .reputation
            .threat_list_path
            .clone()
            .map(|path| Arc::new(FileThreatList::new(path)) as Arc<dyn ThreatListSource>);
        let logger = Arc::new(Logger::new_with_mode(config.journal_file.clone(), config.log_mode));

        Self {
            config,
            threat_source,
            overrides: Vec::new(),
            logger,
        }
    }

    /// Remplace la source de la liste de référence
    pub fn with_threat_source(mut self, source: Arc<dyn ThreatListSource>) -> Self {
        self.threat_source = Some(source);
        self
    }

    /// Remplace l'analyseur intégré portant le même nom
    pub fn with_analyzer(mut self, analyzer: Arc<dyn FlowAnalyzer>) -> Self {
        self.overrides.retain(|a| a.name() != analyzer.name());
        self.overrides.push(analyzer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Chargement, analyses et agrégation, sans entraînement
    pub async fn extract(&self, input: &Path) -> Result<PipelineOutcome> {
        self.run_with(input, false).await
    }

    /// Exécution complète jusqu'à l'entraînement
    pub async fn run(&self, input: &Path) -> Result<PipelineOutcome> {
        self.run_with(input, true).await
    }

    async fn run_with(&self, input: &Path, train: bool) -> Result<PipelineOutcome> {
        let (report_tx, mut report_rx) = mpsc::channel::<Report>(100);

        // Collecteur des rapports d'étape
        let logger = Arc::clone(&self.logger);
        let collector: JoinHandle<Vec<Report>> = tokio::spawn(async move {
            let mut reports = Vec::new();
            while let Some(report) = report_rx.recv().await {
                logger.log_report(&report);
                reports.push(report);
            }
            reports
        });

        let result = self.execute(input, train, &report_tx).await;
        drop(report_tx);
        let reports = collector.await.unwrap_or_default();

        result.map(|mut outcome| {
            outcome.reports = reports;
            outcome
        })
    }

    async fn execute(&self, input: &Path, train: bool, reports: &mpsc::Sender<Report>) -> Result<PipelineOutcome> {
        let mut stages = Vec::new();
        let output_dir = self.config.output_dir.clone();
        fs::create_dir_all(&output_dir)?;

        // Chargement
        let started = Instant::now();
        let path = input.to_path_buf();
        let loaded = joined("loader", tokio::task::spawn_blocking(move || loader::load_path(&path)).await);
        let LoadedFlows { flows, report: load_report } = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                self.report(reports, Report::new(ReportType::Failure, "loader", e.to_string())).await;
                return Err(e);
            }
        };
        self.record_stage(&mut stages, StageStatus::new("loader", StageState::Completed, started.elapsed()));
        self.report_load(reports, &load_report).await;

        let flows = Arc::new(flows);
        let reputation = self.build_reputation(reports).await?;

        let analyzers: Vec<Arc<dyn FlowAnalyzer>> = vec![
            Arc::new(FlowStatsAnalyzer::new(self.config.flow_stats.clone())),
            Arc::new(reputation),
            Arc::new(TemporalAnalyzer::new(self.config.temporal.clone())),
            Arc::new(SizeAnalyzer::new(self.config.size.clone())),
            Arc::new(TlsAnalyzer::new()),
        ];
        let analyzers: Vec<Arc<dyn FlowAnalyzer>> = analyzers
            .into_iter()
            .map(|builtin| match self.overrides.iter().find(|a| a.name() == builtin.name()) {
                Some(custom) => Arc::clone(custom),
                None => builtin,
            })
            .collect();

        // Fan-out : chaque analyseur sur sa propre tâche bloquante
        let stage_timeout = self.config.stage_timeout();
        let tasks = analyzers.iter().map(|analyzer| {
            let analyzer = Arc::clone(analyzer);
            let flows = Arc::clone(&flows);
            async move {
                let started = Instant::now();
                let handle = tokio::task::spawn_blocking(move || analyzer.analyze(&flows));
                let result: StageResult = timeout(stage_timeout, handle).await;
                (result, started.elapsed())
            }
        });
        let results = join_all(tasks).await;

        let mut contributions = Vec::with_capacity(analyzers.len());
        let mut summaries = Vec::new();
        for (analyzer, (result, elapsed)) in analyzers.iter().zip(results) {
            let name = analyzer.name();
            let (status, output) = match result {
                Ok(Ok(Ok(output))) => match &output.degraded {
                    Some(reason) => (
                        StageStatus::new(name, StageState::Degraded, elapsed).with_reason(reason.clone()),
                        Some(output),
                    ),
                    None => (StageStatus::new(name, StageState::Completed, elapsed), Some(output)),
                },
                Ok(Ok(Err(e))) => (
                    StageStatus::new(name, StageState::Failed, elapsed).with_reason(e.to_string()),
                    None,
                ),
                Ok(Err(e)) => (
                    StageStatus::new(name, StageState::Failed, elapsed).with_reason(e.to_string()),
                    None,
                ),
                Err(_) => (
                    StageStatus::new(name, StageState::TimedOut, elapsed)
                        .with_reason(format!("délai de {} s dépassé", stage_timeout.as_secs())),
                    None,
                ),
            };

            self.report_stage(reports, &status).await;
            if status.state != StageState::Completed && self.config.is_strict() {
                self.record_stage(&mut stages, status.clone());
                return Err(PipelineError::AnalyzerHardFailure {
                    stage: name.to_string(),
                    reason: status.reason.unwrap_or_default(),
                });
            }
            self.record_stage(&mut stages, status);

            let contribution = match output {
                Some(output) => {
                    self.write_summary(&output_dir, &output.summary)?;
                    summaries.push(output.summary);
                    GroupContribution::available(analyzer.schema(), output.features)
                }
                None => GroupContribution::unavailable(analyzer.schema()),
            };
            contributions.push(contribution);
        }

        // Barrière : toutes les contributions sont connues
        let mut groups = contributions.into_iter();
        let base = groups.next().ok_or_else(|| {
            PipelineError::AggregationInvariant("aucune contribution de base".to_string())
        })?;
        if base.features.is_none() {
            return Err(PipelineError::AnalyzerHardFailure {
                stage: base.schema.module.to_string(),
                reason: "table de base indisponible".to_string(),
            });
        }
        let groups: Vec<GroupContribution> = groups.collect();

        let started = Instant::now();
        let aggregator = Aggregator::new(self.config.aggregator.clone());
        let table = match aggregator.aggregate(&flows, load_report.has_label_column, &base, &groups) {
            Ok(table) => table,
            Err(e) => {
                self.report(reports, Report::new(ReportType::Failure, "aggregator", e.to_string())).await;
                return Err(e);
            }
        };
        let table_path = output_dir.join(ML_TABLE_FILE);
        table.write_csv(&table_path)?;
        self.record_stage(&mut stages, StageStatus::new("aggregator", StageState::Completed, started.elapsed()));
        self.report(
            reports,
            Report::new(
                ReportType::Info,
                "aggregator",
                format!("{} lignes, {} colonnes", table.len(), table.columns.len()),
            ),
        )
        .await;

        let table = Arc::new(table);
        let training = if train {
            let started = Instant::now();
            let outcome = Trainer::new(self.config.trainer.clone()).train_all(Arc::clone(&table)).await;
            outcome.persist(&output_dir, &self.config.trainer)?;
            self.report_training(reports, &outcome).await;

            let state = if outcome.supervised.is_ok() && outcome.unsupervised.is_ok() {
                StageState::Completed
            } else {
                StageState::Failed
            };
            self.record_stage(&mut stages, StageStatus::new("trainer", state, started.elapsed()));
            Some(outcome)
        } else {
            None
        };

        let run_summary = RunSummary {
            load: &load_report,
            stages: &stages,
            rows: table.len(),
            columns: table.columns.len(),
            aggregation: &table.report,
        };
        fs::write(output_dir.join(RUN_SUMMARY_FILE), serde_json::to_string_pretty(&run_summary)?)?;
        info!("Pipeline terminé: {} flux dans {}", table.len(), table_path.display());

        Ok(PipelineOutcome {
            load_report,
            stages,
            summaries,
            table,
            table_path,
            training,
            reports: Vec::new(),
        })
    }

    /// Charge la liste de référence une seule fois, sous le délai d'étape
    async fn build_reputation(&self, reports: &mpsc::Sender<Report>) -> Result<ReputationScorer> {
        let config = self.config.reputation.clone();
        let source = match &self.threat_source {
            Some(source) => source,
            None => {
                return Ok(ReputationScorer::neutral(
                    config,
                    "aucune liste de référence configurée".to_string(),
                ))
            }
        };

        let failure = match timeout(self.config.stage_timeout(), source.fetch()).await {
            Ok(Ok(list)) => return Ok(ReputationScorer::new(config, Arc::new(list))),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("délai dépassé pour {}", source.describe()),
        };

        if self.config.is_strict() {
            self.report(reports, Report::new(ReportType::Failure, "reputation", failure.clone())).await;
            return Err(PipelineError::AnalyzerHardFailure {
                stage: "reputation".to_string(),
                reason: failure,
            });
        }
        let degraded = PipelineError::AnalyzerDegraded {
            stage: "reputation".to_string(),
            reason: failure.clone(),
        };
        warn!("{}", degraded);
        Ok(ReputationScorer::neutral(config, failure))
    }

    fn write_summary(&self, output_dir: &Path, summary: &AnalyzerSummary) -> Result<()> {
        let path = output_dir.join(format!("{}_summary.json", summary.module_name));
        fs::write(&path, serde_json::to_string_pretty(summary)?)?;
        Ok(())
    }

    fn record_stage(&self, stages: &mut Vec<StageStatus>, status: StageStatus) {
        self.logger.log_stage(&status);
        stages.push(status);
    }

    async fn report(&self, reports: &mpsc::Sender<Report>, report: Report) {
        if let Err(e) = reports.send(report).await {
            error!("Impossible de transmettre le rapport: {}", e);
        }
    }

    async fn report_load(&self, reports: &mpsc::Sender<Report>, load: &LoadReport) {
        let message = format!(
            "{} flux acceptés sur {} lignes",
            load.accepted.to_formatted_string(&Locale::fr),
            load.total_rows.to_formatted_string(&Locale::fr)
        );
        self.report(reports, Report::new(ReportType::Info, "loader", message)).await;

        if load.rejected > 0 {
            let details = serde_json::to_string(&load.rejections).unwrap_or_default();
            self.report(
                reports,
                Report::new(
                    ReportType::Warning,
                    "loader",
                    format!("{} ligne(s) rejetée(s)", load.rejected.to_formatted_string(&Locale::fr)),
                )
                .with_details(details),
            )
            .await;
        }
    }

    async fn report_stage(&self, reports: &mpsc::Sender<Report>, status: &StageStatus) {
        let report_type = match status.state {
            StageState::Completed => return,
            StageState::Degraded => ReportType::Degraded,
            StageState::Failed | StageState::TimedOut => ReportType::Failure,
        };
        let mut report = Report::new(report_type, &status.stage, format!("étape {}", status.state));
        if let Some(reason) = &status.reason {
            report = report.with_details(reason.clone());
        }
        self.report(reports, report).await;
    }

    async fn report_training(&self, reports: &mpsc::Sender<Report>, outcome: &TrainingOutcome) {
        let supervised = match &outcome.supervised {
            Ok(o) => Report::new(
                ReportType::Info,
                "trainer",
                format!("forêt aléatoire: précision test {:.3}", o.metrics.accuracy),
            ),
            Err(e) => Report::new(ReportType::Failure, "trainer", e.to_string()),
        };
        let unsupervised = match &outcome.unsupervised {
            Ok(o) => Report::new(
                ReportType::Info,
                "trainer",
                format!(
                    "isolation forest: {} anomalie(s) ({:.1} %)",
                    o.metrics.anomaly_count,
                    o.metrics.anomaly_rate * 100.0
                ),
            ),
            Err(e) => Report::new(ReportType::Failure, "trainer", e.to_string()),
        };
        self.report(reports, supervised).await;
        self.report(reports, unsupervised).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_state_display() {
        assert_eq!(StageState::TimedOut.to_string(), "timed_out");
        let status = StageStatus::new("tls", StageState::Degraded, Duration::from_millis(1500));
        assert_eq!(status.elapsed_ms, 1500);
        assert!(status.is_usable());
        assert!(!StageStatus::new("tls", StageState::Failed, Duration::ZERO).is_usable());
    }
}
