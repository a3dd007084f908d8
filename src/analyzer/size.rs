//! Distribution des tailles de paquets
//!
//! Les flux sans séquence de tailles sont exclus de cette passe et comptés ;
//! l'agrégateur leur attribue les sentinelles du groupe.

use super::{mean, population_std, saturating_i64, FlowAnalyzer};
use crate::config::SizeConfig;
use crate::error::Result;
use crate::models::{
    AnalyzerOutput, AnalyzerSummary, ColumnKind, ColumnSpec, FeatureSet, FeatureValue, FlowRecord, GroupSchema,
};
use log::{debug, warn};
use num_format::{Locale, ToFormattedString};
use serde_json::json;

pub const MODULE_NAME: &str = "size";

#[derive(Debug, Clone, PartialEq)]
pub struct SizeFeatures {
    pub mean_size: f64,
    pub std_size: f64,
    pub min_size: u32,
    pub max_size: u32,
    pub total_size: u64,
    pub small_packet_ratio: f64,
    pub near_mtu_ratio: f64,
}

pub struct SizeAnalyzer {
    config: SizeConfig,
}

impl SizeAnalyzer {
    pub fn new(config: SizeConfig) -> Self {
        Self { config }
    }

    /// None pour un flux sans paquet
    pub fn compute(&self, sizes: &[u32]) -> Option<SizeFeatures> {
        if sizes.is_empty() {
            return None;
        }

        let as_f64: Vec<f64> = sizes.iter().map(|&s| s as f64).collect();
        let count = sizes.len() as f64;
        let small = sizes.iter().filter(|&&s| s < self.config.small_packet_threshold).count();
        let near_mtu = sizes
            .iter()
            .filter(|&&s| s >= self.config.mtu_low && s <= self.config.mtu_high)
            .count();

        Some(SizeFeatures {
            mean_size: mean(&as_f64),
            std_size: population_std(&as_f64),
            min_size: sizes.iter().copied().min().unwrap_or(0),
            max_size: sizes.iter().copied().max().unwrap_or(0),
            total_size: sizes.iter().map(|&s| s as u64).sum(),
            small_packet_ratio: small as f64 / count,
            near_mtu_ratio: near_mtu as f64 / count,
        })
    }
}

impl FlowAnalyzer for SizeAnalyzer {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn schema(&self) -> GroupSchema {
        GroupSchema {
            module: MODULE_NAME,
            presence_flag: Some("has_size"),
            columns: vec![
                ColumnSpec::new("mean_size", ColumnKind::Float),
                ColumnSpec::new("std_size", ColumnKind::Float),
                ColumnSpec::new("min_size", ColumnKind::Int),
                ColumnSpec::new("max_size", ColumnKind::Int),
                ColumnSpec::new("total_size", ColumnKind::Int),
                ColumnSpec::new("small_packet_ratio", ColumnKind::Float),
                ColumnSpec::new("near_mtu_ratio", ColumnKind::Float),
            ],
            sentinel: vec![
                FeatureValue::Float(0.0),
                FeatureValue::Float(0.0),
                FeatureValue::Int(0),
                FeatureValue::Int(0),
                FeatureValue::Int(0),
                FeatureValue::Float(0.0),
                FeatureValue::Float(0.0),
            ],
        }
    }

    fn analyze(&self, flows: &[FlowRecord]) -> Result<AnalyzerOutput> {
        let mut features = FeatureSet::new(MODULE_NAME);
        let mut excluded = 0usize;
        let mut all_sizes: Vec<f64> = Vec::new();
        let mut small_ratios = Vec::new();
        let mut mtu_ratios = Vec::new();

        for flow in flows {
            let f = match self.compute(&flow.packet_sizes) {
                Some(f) => f,
                None => {
                    excluded += 1;
                    continue;
                }
            };

            all_sizes.extend(flow.packet_sizes.iter().map(|&s| s as f64));
            small_ratios.push(f.small_packet_ratio);
            mtu_ratios.push(f.near_mtu_ratio);
            features.push(
                &flow.flow_id,
                vec![
                    FeatureValue::Float(f.mean_size),
                    FeatureValue::Float(f.std_size),
                    FeatureValue::Int(f.min_size as i64),
                    FeatureValue::Int(f.max_size as i64),
                    FeatureValue::Int(saturating_i64(f.total_size)),
                    FeatureValue::Float(f.small_packet_ratio),
                    FeatureValue::Float(f.near_mtu_ratio),
                ],
            );
        }

        if excluded > 0 {
            warn!(
                "Tailles: {} flux sans paquet exclus de l'analyse",
                excluded.to_formatted_string(&Locale::fr)
            );
        }
        debug!("Distribution des tailles calculée pour {} flux", features.len());

        let aggregate_statistics = json!({
            "packets_observed": all_sizes.len(),
            "mean_packet_size": mean(&all_sizes),
            "std_packet_size": population_std(&all_sizes),
            "mean_small_packet_ratio": mean(&small_ratios),
            "mean_near_mtu_ratio": mean(&mtu_ratios),
            "small_packet_threshold": self.config.small_packet_threshold,
            "mtu_range": [self.config.mtu_low, self.config.mtu_high],
        });

        Ok(AnalyzerOutput {
            summary: AnalyzerSummary {
                module_name: MODULE_NAME.to_string(),
                flow_count: features.len(),
                excluded_count: excluded,
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

    #[test]
    fn test_size_features() {
        let analyzer = SizeAnalyzer::new(SizeConfig::default());
        let f = analyzer.compute(&[40, 60, 1420, 1500]).unwrap();

        assert_eq!(f.mean_size, 755.0);
        assert_eq!(f.min_size, 40);
        assert_eq!(f.max_size, 1500);
        assert_eq!(f.total_size, 3020);
        assert_eq!(f.small_packet_ratio, 0.5);
        assert_eq!(f.near_mtu_ratio, 0.5);
    }

    #[test]
    fn test_threshold_is_strict() {
        let analyzer = SizeAnalyzer::new(SizeConfig::default());
        let f = analyzer.compute(&[64, 64]).unwrap();
        assert_eq!(f.small_packet_ratio, 0.0);
        assert_eq!(f.std_size, 0.0);
    }

    #[test]
    fn test_empty_flows_are_excluded_and_counted() {
        let mut sized = flow("sized", 443);
        sized.packet_sizes = vec![100, 200];
        let output = SizeAnalyzer::new(SizeConfig::default())
            .analyze(&[sized, flow("empty", 443)])
            .unwrap();

        assert_eq!(output.features.len(), 1);
        assert_eq!(output.features.rows[0].flow_id, "sized");
        assert_eq!(output.summary.excluded_count, 1);
        assert_eq!(output.summary.aggregate_statistics["packets_observed"], 2);
    }
}
