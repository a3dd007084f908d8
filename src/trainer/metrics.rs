//! Métriques d'évaluation du classifieur

use crate::models::Label;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CLASS_COUNT: usize = 2;

/// Matrice de confusion, lignes = classe réelle, colonnes = classe prédite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<String>,
    pub matrix: [[usize; CLASS_COUNT]; CLASS_COUNT],
}

impl ConfusionMatrix {
    pub fn from_predictions(actual: &[usize], predicted: &[usize]) -> Self {
        let mut matrix = [[0usize; CLASS_COUNT]; CLASS_COUNT];
        for (&a, &p) in actual.iter().zip(predicted) {
            if a < CLASS_COUNT && p < CLASS_COUNT {
                matrix[a][p] += 1;
            }
        }
        Self {
            labels: (0..CLASS_COUNT)
                .map(|c| Label::from_class_index(c).as_str().to_string())
                .collect(),
            matrix,
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: usize = (0..CLASS_COUNT).map(|c| self.matrix[c][c]).sum();
        correct as f64 / total as f64
    }

    pub fn class_metrics(&self, class: usize) -> ClassMetrics {
        let tp = self.matrix[class][class];
        let predicted: usize = (0..CLASS_COUNT).map(|r| self.matrix[r][class]).sum();
        let support: usize = self.matrix[class].iter().sum();

        let precision = ratio(tp, predicted);
        let recall = ratio(tp, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        ClassMetrics {
            precision,
            recall,
            f1,
            support,
        }
    }

    /// Métriques par classe, indexées par nom d'étiquette
    pub fn per_class(&self) -> BTreeMap<String, ClassMetrics> {
        (0..CLASS_COUNT)
            .map(|c| (self.labels[c].clone(), self.class_metrics(c)))
            .collect()
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedMetrics {
    pub confusion_matrix: ConfusionMatrix,
    pub per_class: BTreeMap<String, ClassMetrics>,
    pub accuracy: f64,
    pub train_accuracy: f64,
    pub train_size: usize,
    pub test_size: usize,
    /// Lignes étiquetées `unknown`, ignorées par l'apprentissage supervisé
    pub ignored_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsupervisedMetrics {
    pub total_flows: usize,
    pub anomaly_count: usize,
    pub anomaly_rate: f64,
    pub contamination: f64,
    pub threshold: f64,
    /// Score d'anomalie par flow_id, dans l'ordre de la table
    pub scores: Vec<(String, f64)>,
}
