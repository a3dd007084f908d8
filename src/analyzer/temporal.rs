//! Motifs temporels des arrivées de paquets
//!
//! Les écarts entre horodatages consécutifs donnent l'inter-arrivée moyenne,
//! la gigue (écart-type de population), le score de rafale et l'entropie de
//! l'histogramme des écarts. Un flux de moins de deux paquets n'a aucun écart :
//! il reçoit les sentinelles à zéro et `has_multi_packet=false`.
//!
//! Sans horodatages, un flux agrégé d'au moins deux paquets reçoit une
//! inter-arrivée moyenne `durée / paquets` ; gigue, rafale et entropie restent
//! à leurs sentinelles.

use super::{mean, population_std, shannon_entropy, FlowAnalyzer};
use crate::config::TemporalConfig;
use crate::error::Result;
use crate::models::{
    AnalyzerOutput, AnalyzerSummary, ColumnKind, ColumnSpec, FeatureSet, FeatureValue, FlowRecord, GroupSchema,
};
use log::debug;
use serde_json::json;

pub const MODULE_NAME: &str = "temporal";

/// Caractéristiques temporelles d'un flux
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemporalFeatures {
    pub has_multi_packet: bool,
    pub mean_interarrival: f64,
    pub jitter: f64,
    pub burst_score: f64,
    pub temporal_entropy: f64,
    pub packet_rate: f64,
}

pub struct TemporalAnalyzer {
    config: TemporalConfig,
}

impl TemporalAnalyzer {
    pub fn new(config: TemporalConfig) -> Self {
        Self { config }
    }

    pub fn compute(&self, flow: &FlowRecord) -> TemporalFeatures {
        let timestamps = &flow.packet_timestamps;
        let packet_count = if timestamps.is_empty() {
            flow.total_packets as f64
        } else {
            timestamps.len() as f64
        };
        let duration = flow.duration();
        let packet_rate = if duration > 0.0 { finite_or_zero(packet_count / duration) } else { 0.0 };

        if timestamps.is_empty() && flow.total_packets >= 2 {
            return TemporalFeatures {
                has_multi_packet: true,
                mean_interarrival: finite_or_zero(duration / packet_count),
                packet_rate,
                ..TemporalFeatures::default()
            };
        }

        if timestamps.len() < 2 {
            return TemporalFeatures {
                packet_rate,
                ..TemporalFeatures::default()
            };
        }

        let deltas: Vec<f64> = timestamps.windows(2).map(|w| (w[1] - w[0]).max(0.0)).collect();
        let mean_delta = mean(&deltas);

        let threshold = self.config.burst_fraction * mean_delta;
        let bursts = deltas.iter().filter(|&&d| d < threshold).count();

        TemporalFeatures {
            has_multi_packet: true,
            mean_interarrival: mean_delta,
            jitter: population_std(&deltas),
            burst_score: bursts as f64 / timestamps.len() as f64,
            temporal_entropy: self.delta_entropy(&deltas),
            packet_rate,
        }
    }

    /// Entropie de l'histogramme des écarts, classes logarithmiques
    fn delta_entropy(&self, deltas: &[f64]) -> f64 {
        let bins = self.config.entropy_bins.max(1);
        let positive = deltas.iter().copied().filter(|&d| d > 0.0);
        let low = positive.clone().fold(f64::INFINITY, f64::min);
        let high = positive.fold(0.0, f64::max);

        if !low.is_finite() || high <= low {
            return 0.0;
        }

        let (log_low, log_high) = (low.ln(), high.ln());
        let mut counts = vec![0usize; bins];
        for &delta in deltas {
            let bin = if delta <= 0.0 {
                0
            } else {
                let position = (delta.ln() - log_low) / (log_high - log_low);
                ((position * bins as f64).floor() as usize).min(bins - 1)
            };
            counts[bin] += 1;
        }
        shannon_entropy(&counts)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

impl FlowAnalyzer for TemporalAnalyzer {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn schema(&self) -> GroupSchema {
        GroupSchema {
            module: MODULE_NAME,
            presence_flag: Some("has_temporal"),
            columns: vec![
                ColumnSpec::new("has_multi_packet", ColumnKind::Bool),
                ColumnSpec::new("mean_interarrival", ColumnKind::Float),
                ColumnSpec::new("jitter", ColumnKind::Float),
                ColumnSpec::new("burst_score", ColumnKind::Float),
                ColumnSpec::new("temporal_entropy", ColumnKind::Float),
                ColumnSpec::new("packet_rate", ColumnKind::Float),
            ],
            sentinel: vec![
                FeatureValue::Bool(false),
                FeatureValue::Float(0.0),
                FeatureValue::Float(0.0),
                FeatureValue::Float(0.0),
                FeatureValue::Float(0.0),
                FeatureValue::Float(0.0),
            ],
        }
    }

    fn analyze(&self, flows: &[FlowRecord]) -> Result<AnalyzerOutput> {
        let mut features = FeatureSet::new(MODULE_NAME);
        let mut computed = Vec::with_capacity(flows.len());

        for flow in flows {
            let f = self.compute(flow);
            features.push(
                &flow.flow_id,
                vec![
                    FeatureValue::Bool(f.has_multi_packet),
                    FeatureValue::Float(f.mean_interarrival),
                    FeatureValue::Float(f.jitter),
                    FeatureValue::Float(f.burst_score),
                    FeatureValue::Float(f.temporal_entropy),
                    FeatureValue::Float(f.packet_rate),
                ],
            );
            computed.push(f);
        }

        let multi: Vec<&TemporalFeatures> = computed.iter().filter(|f| f.has_multi_packet).collect();
        let collect = |get: fn(&TemporalFeatures) -> f64| -> Vec<f64> { multi.iter().map(|f| get(f)).collect() };
        let rates: Vec<f64> = computed.iter().map(|f| f.packet_rate).collect();
        debug!("Motifs temporels calculés pour {} flux ({} multi-paquets)", features.len(), multi.len());

        let aggregate_statistics = json!({
            "multi_packet_flows": multi.len(),
            "single_packet_flows": computed.len() - multi.len(),
            "mean_interarrival": mean(&collect(|f| f.mean_interarrival)),
            "mean_jitter": mean(&collect(|f| f.jitter)),
            "mean_burst_score": mean(&collect(|f| f.burst_score)),
            "mean_temporal_entropy": mean(&collect(|f| f.temporal_entropy)),
            "mean_packet_rate": mean(&rates),
            "entropy_bins": self.config.entropy_bins,
            "burst_fraction": self.config.burst_fraction,
        });

        Ok(AnalyzerOutput {
            summary: AnalyzerSummary {
                module_name: MODULE_NAME.to_string(),
                flow_count: features.len(),
                excluded_count: 0,
                aggregate_statistics,
            },
            features,
            degraded: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::test_support::flow;

    fn analyzer() -> TemporalAnalyzer {
        TemporalAnalyzer::new(TemporalConfig::default())
    }

    #[test]
    fn test_single_packet_sentinels() {
        let mut f = flow("single", 443);
        f.packet_timestamps = vec![1000.5];
        f.total_packets = 1;

        let features = analyzer().compute(&f);
        assert!(!features.has_multi_packet);
        assert_eq!(features.jitter, 0.0);
        assert_eq!(features.burst_score, 0.0);
        assert_eq!(features.temporal_entropy, 0.0);
        assert_eq!(features.packet_rate, 1.0);
    }

    #[test]
    fn test_zero_duration_has_zero_rate() {
        let mut f = flow("instant", 53);
        f.end_time = f.start_time;
        f.packet_timestamps = vec![1000.0, 1000.0];
        let features = analyzer().compute(&f);
        assert!(features.has_multi_packet);
        assert_eq!(features.packet_rate, 0.0);
        assert_eq!(features.temporal_entropy, 0.0);
        assert!(!features.jitter.is_nan());
    }

    #[test]
    fn test_regular_arrivals() {
        let mut f = flow("steady", 443);
        f.packet_timestamps = vec![1000.0, 1000.25, 1000.5, 1000.75, 1001.0];
        let features = analyzer().compute(&f);

        assert_eq!(features.mean_interarrival, 0.25);
        assert_eq!(features.jitter, 0.0);
        assert_eq!(features.burst_score, 0.0);
        // Plage dégénérée : tous les écarts sont égaux
        assert_eq!(features.temporal_entropy, 0.0);
        assert_eq!(features.packet_rate, 5.0);
    }

    #[test]
    fn test_burst_and_entropy() {
        let mut f = flow("bursty", 443);
        // Écarts : 0.001, 0.001, 0.998, 0.0
        f.packet_timestamps = vec![1000.0, 1000.001, 1000.002, 1001.0, 1001.0];
        let features = analyzer().compute(&f);

        // Moyenne 0.25, seuil 0.025 : trois écarts en rafale sur cinq paquets
        assert!((features.burst_score - 0.6).abs() < 1e-12);
        assert!(features.jitter > 0.4);
        // Classes : {0.0, 0.001, 0.001} en 0 et {0.998} en 9
        let expected = -(0.75f64 * 0.75f64.log2() + 0.25 * 0.25f64.log2());
        assert!((features.temporal_entropy - expected).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_only_flow_uses_duration() {
        let mut f = flow("aggregate", 443);
        f.end_time = f.start_time + 10.0;
        f.total_packets = 100;

        let features = analyzer().compute(&f);
        assert!(features.has_multi_packet);
        assert!((features.mean_interarrival - 0.1).abs() < 1e-12);
        assert_eq!(features.packet_rate, 10.0);
        assert_eq!(features.jitter, 0.0);
        assert_eq!(features.burst_score, 0.0);
        assert_eq!(features.temporal_entropy, 0.0);
    }

    #[test]
    fn test_subnormal_duration_rate_stays_finite() {
        let mut f = flow("tiny", 443);
        f.start_time = 0.0;
        f.end_time = 1e-320;
        f.total_packets = 5;

        let features = analyzer().compute(&f);
        assert_eq!(features.packet_rate, 0.0);
        assert!(features.mean_interarrival.is_finite());
    }

    #[test]
    fn test_every_flow_gets_a_row() {
        let mut multi = flow("m", 443);
        multi.packet_timestamps = vec![1000.0, 1000.5, 1001.0];
        let output = analyzer().analyze(&[multi, flow("empty", 80)]).unwrap();

        assert_eq!(output.features.len(), 2);
        assert_eq!(output.features.rows[1].values[0], FeatureValue::Bool(false));
        assert_eq!(output.summary.aggregate_statistics["single_packet_flows"], 1);
    }
}
