//! Entraînement et évaluation des modèles
//!
//! Deux chemins indépendants partagent la même matrice de caractéristiques :
//! une forêt aléatoire supervisée (lignes `vpn`/`non-vpn` uniquement, partition
//! stratifiée et graine fixe) et une Isolation Forest non supervisée qui ignore
//! l'étiquette. Les préconditions sont vérifiées avant tout ajustement.

pub mod forest;
pub mod isolation;
pub mod metrics;

pub use forest::{ForestParams, RandomForest};
pub use isolation::{IsolationForest, IsolationParams};
pub use metrics::{ConfusionMatrix, SupervisedMetrics, UnsupervisedMetrics};

use crate::aggregator::AggregatedTable;
use crate::config::TrainerConfig;
use crate::error::{PipelineError, Result};
use crate::models::ColumnKind;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const SUPERVISED_MODEL_FILE: &str = "supervised_model.json";
pub const UNSUPERVISED_MODEL_FILE: &str = "unsupervised_model.json";
pub const METRICS_FILE: &str = "training_metrics.json";

/// Colonnes numériques (booléens en 0/1) extraites de la table agrégée
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    /// Exclut flow_id, label et les colonnes textuelles
    pub fn from_table(table: &AggregatedTable) -> Self {
        let selected: Vec<usize> = table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind != ColumnKind::Text)
            .map(|(i, _)| i)
            .collect();

        Self {
            names: selected.iter().map(|&i| table.columns[i].name.clone()).collect(),
            rows: table
                .rows
                .iter()
                .map(|row| {
                    selected
                        .iter()
                        .map(|&i| row.values.get(i).and_then(|v| v.as_f64()).unwrap_or(0.0))
                        .collect()
                })
                .collect(),
        }
    }
}

/// Partition d'indices de lignes
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Partition stratifiée : chaque classe contribue round(n·fraction) lignes de test
/// et conserve au moins une ligne d'entraînement
pub fn stratified_split(rows: &[(usize, usize)], test_fraction: f64, rng: &mut StdRng) -> Partition {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(row, class) in rows {
        by_class.entry(class).or_default().push(row);
    }

    let fraction = test_fraction.clamp(0.0, 1.0);
    let mut partition = Partition {
        train: Vec::new(),
        test: Vec::new(),
    };
    for members in by_class.values_mut() {
        members.shuffle(rng);
        let n_test = ((members.len() as f64 * fraction).round() as usize).min(members.len().saturating_sub(1));
        partition.test.extend_from_slice(&members[..n_test]);
        partition.train.extend_from_slice(&members[n_test..]);
    }
    partition.train.sort_unstable();
    partition.test.sort_unstable();
    partition
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisedOutcome {
    pub model: RandomForest,
    pub metrics: SupervisedMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnsupervisedOutcome {
    pub model: IsolationForest,
    pub metrics: UnsupervisedMetrics,
}

/// Résultat des deux chemins ; l'échec de l'un n'empêche pas l'autre
#[derive(Debug)]
pub struct TrainingOutcome {
    pub supervised: Result<SupervisedOutcome>,
    pub unsupervised: Result<UnsupervisedOutcome>,
}

/// Contenu de `training_metrics.json`
#[derive(Debug, Serialize)]
struct MetricsRecord<'a> {
    seed: u64,
    feature_columns: &'a [String],
    supervised: Option<&'a SupervisedMetrics>,
    unsupervised: Option<&'a UnsupervisedMetrics>,
    errors: BTreeMap<&'static str, String>,
}

impl TrainingOutcome {
    pub fn persist(&self, output_dir: &Path, config: &TrainerConfig) -> Result<()> {
        fs::create_dir_all(output_dir)?;

        let mut errors = BTreeMap::new();
        let mut feature_columns: &[String] = &[];

        match &self.supervised {
            Ok(outcome) => {
                fs::write(
                    output_dir.join(SUPERVISED_MODEL_FILE),
                    serde_json::to_string_pretty(&outcome.model)?,
                )?;
                feature_columns = outcome.model.feature_names.as_slice();
            }
            Err(e) => {
                errors.insert("supervised", e.to_string());
            }
        }
        match &self.unsupervised {
            Ok(outcome) => {
                fs::write(
                    output_dir.join(UNSUPERVISED_MODEL_FILE),
                    serde_json::to_string_pretty(&outcome.model)?,
                )?;
                feature_columns = outcome.model.feature_names.as_slice();
            }
            Err(e) => {
                errors.insert("unsupervised", e.to_string());
            }
        }

        let record = MetricsRecord {
            seed: config.seed,
            feature_columns,
            supervised: self.supervised.as_ref().ok().map(|o| &o.metrics),
            unsupervised: self.unsupervised.as_ref().ok().map(|o| &o.metrics),
            errors,
        };
        fs::write(output_dir.join(METRICS_FILE), serde_json::to_string_pretty(&record)?)?;
        info!("Artefacts d'entraînement écrits dans {}", output_dir.display());
        Ok(())
    }
}

/// Aplatit le résultat d'une tâche bloquante
pub(crate) fn joined<T>(stage: &str, result: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    result.unwrap_or_else(|e| {
        Err(PipelineError::Task {
            stage: stage.to_string(),
            reason: e.to_string(),
        })
    })
}

pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    fn check_table(table: &AggregatedTable, matrix: &FeatureMatrix) -> Result<()> {
        if table.is_empty() {
            return Err(PipelineError::TrainingPrecondition(
                "table de caractéristiques vide".to_string(),
            ));
        }
        if matrix.names.is_empty() {
            return Err(PipelineError::TrainingPrecondition(
                "aucune colonne numérique exploitable".to_string(),
            ));
        }
        Ok(())
    }

    pub fn train_supervised(&self, table: &AggregatedTable) -> Result<SupervisedOutcome> {
        let matrix = FeatureMatrix::from_table(table);
        Self::check_table(table, &matrix)?;
        if !table.has_label_column {
            return Err(PipelineError::TrainingPrecondition("colonne label absente".to_string()));
        }

        let labelled: Vec<(usize, usize)> = table
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.label.and_then(|l| l.class_index()).map(|c| (i, c)))
            .collect();
        let mut classes: Vec<usize> = labelled.iter().map(|&(_, c)| c).collect();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() < 2 {
            return Err(PipelineError::TrainingPrecondition(format!(
                "au moins deux classes distinctes requises, {} trouvée(s)",
                classes.len()
            )));
        }

        let ignored_rows = table.len() - labelled.len();
        if ignored_rows > 0 {
            warn!("{} ligne(s) sans étiquette exploitable ignorée(s) par le classifieur", ignored_rows);
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let partition = stratified_split(&labelled, self.config.test_fraction, &mut rng);
        let class_of: BTreeMap<usize, usize> = labelled.into_iter().collect();

        let gather = |indices: &[usize]| -> (Vec<Vec<f64>>, Vec<usize>) {
            indices
                .iter()
                .map(|i| (matrix.rows[*i].clone(), class_of[i]))
                .unzip()
        };
        let (x_train, y_train) = gather(&partition.train);
        let (x_test, y_test) = gather(&partition.test);

        let params = ForestParams {
            n_trees: self.config.n_trees,
            max_depth: self.config.max_depth,
            min_samples_split: self.config.min_samples_split,
        };
        let model = RandomForest::fit(matrix.names.clone(), &x_train, &y_train, &params, &mut rng);

        let train_predictions: Vec<usize> = x_train.iter().map(|s| model.predict(s)).collect();
        let test_predictions: Vec<usize> = x_test.iter().map(|s| model.predict(s)).collect();
        let train_cm = ConfusionMatrix::from_predictions(&y_train, &train_predictions);
        let confusion_matrix = ConfusionMatrix::from_predictions(&y_test, &test_predictions);
        if x_test.is_empty() {
            warn!("Partition de test vide: métriques calculées sans données de test");
        }

        let metrics = SupervisedMetrics {
            per_class: confusion_matrix.per_class(),
            accuracy: confusion_matrix.accuracy(),
            confusion_matrix,
            train_accuracy: train_cm.accuracy(),
            train_size: x_train.len(),
            test_size: x_test.len(),
            ignored_rows,
        };
        info!(
            "Forêt aléatoire: {} arbres, précision test {:.3}, entraînement {:.3}",
            model.n_trees(),
            metrics.accuracy,
            metrics.train_accuracy
        );

        Ok(SupervisedOutcome { model, metrics })
    }

    pub fn train_unsupervised(&self, table: &AggregatedTable) -> Result<UnsupervisedOutcome> {
        let matrix = FeatureMatrix::from_table(table);
        Self::check_table(table, &matrix)?;

        let params = IsolationParams {
            n_trees: self.config.isolation_trees,
            sample_size: self.config.isolation_sample_size,
            contamination: self.config.contamination,
        };
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let model = IsolationForest::fit(matrix.names.clone(), &matrix.rows, &params, &mut rng);

        let scores: Vec<f64> = matrix.rows.iter().map(|s| model.score(s)).collect();
        let anomaly_count = model.flag_top(&scores).iter().filter(|&&f| f).count();
        let total_flows = scores.len();

        let metrics = UnsupervisedMetrics {
            total_flows,
            anomaly_count,
            anomaly_rate: anomaly_count as f64 / total_flows as f64,
            contamination: model.contamination,
            threshold: model.threshold,
            scores: table.rows.iter().map(|r| r.flow_id.clone()).zip(scores).collect(),
        };
        info!(
            "Isolation Forest: {} anomalie(s) sur {} flux (contamination {})",
            anomaly_count, total_flows, metrics.contamination
        );

        Ok(UnsupervisedOutcome { model, metrics })
    }

    /// Lance les deux chemins en parallèle sur des tâches bloquantes
    pub async fn train_all(&self, table: Arc<AggregatedTable>) -> TrainingOutcome {
        let supervised_trainer = Trainer::new(self.config.clone());
        let supervised_table = Arc::clone(&table);
        let supervised =
            tokio::task::spawn_blocking(move || supervised_trainer.train_supervised(&supervised_table));

        let unsupervised_trainer = Trainer::new(self.config.clone());
        let unsupervised = tokio::task::spawn_blocking(move || unsupervised_trainer.train_unsupervised(&table));

        let (supervised, unsupervised) = tokio::join!(supervised, unsupervised);

        TrainingOutcome {
            supervised: joined("supervised", supervised),
            unsupervised: joined("unsupervised", unsupervised),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatedRow;
    use crate::models::{ColumnSpec, FeatureValue, Label};

    fn table(labels: &[Option<Label>]) -> AggregatedTable {
        AggregatedTable {
            columns: vec![
                ColumnSpec::new("jitter", ColumnKind::Float),
                ColumnSpec::new("protocol", ColumnKind::Text),
                ColumnSpec::new("has_tls", ColumnKind::Bool),
            ],
            rows: labels
                .iter()
                .enumerate()
                .map(|(i, &label)| {
                    let vpn = label == Some(Label::Vpn);
                    AggregatedRow {
                        flow_id: format!("f{}", i),
                        values: vec![
                            FeatureValue::Float(if vpn { 0.5 + i as f64 * 0.01 } else { 0.01 }),
                            FeatureValue::Text("TCP".to_string()),
                            FeatureValue::Bool(vpn),
                        ],
                        label,
                    }
                })
                .collect(),
            has_label_column: true,
            report: Default::default(),
        }
    }

    fn config() -> TrainerConfig {
        TrainerConfig {
            n_trees: 15,
            isolation_trees: 20,
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn test_feature_matrix_skips_text() {
        let matrix = FeatureMatrix::from_table(&table(&[Some(Label::Vpn)]));
        assert_eq!(matrix.names, vec!["jitter", "has_tls"]);
        assert_eq!(matrix.rows[0][1], 1.0);
    }

    #[test]
    fn test_stratified_split_keeps_proportions() {
        let rows: Vec<(usize, usize)> = (0..10).map(|i| (i, if i < 5 { 0 } else { 1 })).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let partition = stratified_split(&rows, 0.2, &mut rng);

        assert_eq!(partition.test.len(), 2);
        assert_eq!(partition.train.len(), 8);
        assert_eq!(partition.test.iter().filter(|&&i| i < 5).count(), 1);

        let again = stratified_split(&rows, 0.2, &mut StdRng::seed_from_u64(42));
        assert_eq!(partition, again);
    }

    #[test]
    fn test_single_member_class_stays_in_training() {
        let rows = vec![(0, 0), (1, 1), (2, 1)];
        let partition = stratified_split(&rows, 0.9, &mut StdRng::seed_from_u64(1));
        assert!(partition.train.contains(&0));
        assert_eq!(partition.train.len(), 2);
    }

    #[test]
    fn test_supervised_preconditions() {
        let trainer = Trainer::new(config());

        let one_class = table(&[Some(Label::Vpn), Some(Label::Vpn), Some(Label::Unknown)]);
        assert!(matches!(
            trainer.train_supervised(&one_class),
            Err(PipelineError::TrainingPrecondition(_))
        ));

        let mut unlabelled = table(&[Some(Label::Vpn), Some(Label::NonVpn)]);
        unlabelled.has_label_column = false;
        assert!(matches!(
            trainer.train_supervised(&unlabelled),
            Err(PipelineError::TrainingPrecondition(_))
        ));

        let empty = table(&[]);
        assert!(matches!(
            trainer.train_unsupervised(&empty),
            Err(PipelineError::TrainingPrecondition(_))
        ));
    }

    #[test]
    fn test_supervised_training_ignores_unknown_rows() {
        let labels = [
            Some(Label::Vpn),
            Some(Label::NonVpn),
            Some(Label::Vpn),
            Some(Label::NonVpn),
            Some(Label::Unknown),
            None,
        ];
        let outcome = Trainer::new(config()).train_supervised(&table(&labels)).unwrap();
        assert_eq!(outcome.metrics.ignored_rows, 2);
        assert_eq!(outcome.metrics.train_size + outcome.metrics.test_size, 4);
        assert_eq!(outcome.metrics.train_accuracy, 1.0);
    }

    #[test]
    fn test_unsupervised_flags_contamination_share() {
        let labels: Vec<Option<Label>> = (0..20).map(|i| Some(if i == 0 { Label::Vpn } else { Label::NonVpn })).collect();
        let outcome = Trainer::new(config()).train_unsupervised(&table(&labels)).unwrap();
        assert_eq!(outcome.metrics.total_flows, 20);
        assert_eq!(outcome.metrics.anomaly_count, 2);
        assert_eq!(outcome.metrics.scores.len(), 20);
    }

    #[tokio::test]
    async fn test_train_all_runs_both_paths() {
        let t = Arc::new(table(&[Some(Label::Vpn), Some(Label::NonVpn), Some(Label::Vpn), Some(Label::NonVpn)]));
        let trainer = Trainer::new(config());
        let outcome = trainer.train_all(t).await;
        assert!(outcome.supervised.is_ok());
        assert!(outcome.unsupervised.is_ok());

        let dir = tempfile::tempdir().unwrap();
        outcome.persist(dir.path(), &config()).unwrap();
        assert!(dir.path().join(SUPERVISED_MODEL_FILE).exists());
        assert!(dir.path().join(UNSUPERVISED_MODEL_FILE).exists());
        let metrics: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap()).unwrap();
        assert_eq!(metrics["seed"], 42);
        assert!(metrics["supervised"]["confusion_matrix"].is_object());
    }
}
