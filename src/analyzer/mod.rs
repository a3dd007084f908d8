//! Passes d'analyse par flux
//!
//! Chaque analyseur lit le même ensemble de flux normalisés, sans état partagé,
//! et produit son propre `FeatureSet` accompagné d'un résumé JSON.

pub mod flow_stats;
pub mod reputation;
pub mod size;
pub mod temporal;
pub mod tls;

pub use flow_stats::FlowStatsAnalyzer;
pub use reputation::{ReputationScorer, ThreatList, ThreatListSource};
pub use size::SizeAnalyzer;
pub use temporal::TemporalAnalyzer;
pub use tls::TlsAnalyzer;

use crate::error::Result;
use crate::models::{AnalyzerOutput, FlowRecord, GroupSchema};

/// Interface commune des analyseurs
pub trait FlowAnalyzer: Send + Sync {
    /// Nom du module, utilisé pour les résumés et les rapports
    fn name(&self) -> &'static str;

    /// Colonnes produites et sentinelles associées
    fn schema(&self) -> GroupSchema;

    fn analyze(&self, flows: &[FlowRecord]) -> Result<AnalyzerOutput>;
}

/// Moyenne arithmétique, 0 pour une série vide
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Écart-type de population
pub fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values
        .iter()
        .map(|x| {
            let diff = x - avg;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

/// Percentile par interpolation linéaire sur une série triée
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Compteur non signé vers colonne entière, saturé à `i64::MAX`
pub fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Entropie de Shannon (base 2) d'un histogramme
pub fn shannon_entropy(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let entropy = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total as f64;
            -p * p.log2()
        })
        .sum::<f64>();
    // Évite un -0.0 dans les sorties
    entropy.max(0.0)
}
