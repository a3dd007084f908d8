//! Statistiques descriptives par flux et globales
//!
//! Cette passe produit la table de base de l'agrégateur : chaque flux
//! normalisé y figure exactement une fois.

use super::{mean, percentile, saturating_i64, shannon_entropy, FlowAnalyzer};
use crate::config::FlowStatsConfig;
use crate::error::Result;
use crate::models::{
    AnalyzerOutput, AnalyzerSummary, ColumnKind, ColumnSpec, FeatureSet, FeatureValue, FlowRecord, GroupSchema,
};
use log::debug;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

pub const MODULE_NAME: &str = "flow_stats";

pub struct FlowStatsAnalyzer {
    config: FlowStatsConfig,
}

impl FlowStatsAnalyzer {
    pub fn new(config: FlowStatsConfig) -> Self {
        Self { config }
    }

    fn flow_features(flow: &FlowRecord) -> Vec<FeatureValue> {
        let mean_packet_size = if flow.total_packets > 0 {
            flow.total_bytes as f64 / flow.total_packets as f64
        } else {
            0.0
        };

        vec![
            FeatureValue::Float(flow.duration()),
            FeatureValue::Int(saturating_i64(flow.total_packets)),
            FeatureValue::Int(saturating_i64(flow.total_bytes)),
            FeatureValue::Float(mean_packet_size),
            FeatureValue::Text(flow.protocol.to_string()),
            FeatureValue::Int(flow.protocol.code()),
            FeatureValue::Int(flow.src_port as i64),
            FeatureValue::Int(flow.dst_port as i64),
        ]
    }

    /// Ports de destination les plus fréquents (égalités départagées par numéro de port)
    fn top_ports(&self, flows: &[FlowRecord]) -> Vec<serde_json::Value> {
        let mut counts: HashMap<u16, usize> = HashMap::new();
        for flow in flows {
            *counts.entry(flow.dst_port).or_insert(0) += 1;
        }

        let mut ranked: Vec<(u16, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(self.config.top_n_ports)
            .map(|(port, count)| json!({ "port": port, "flows": count }))
            .collect()
    }

    fn global_summary(&self, flows: &[FlowRecord]) -> serde_json::Value {
        let total_bytes = flows.iter().fold(0u64, |acc, f| acc.saturating_add(f.total_bytes));
        let total_packets = flows.iter().fold(0u64, |acc, f| acc.saturating_add(f.total_packets));

        let mut protocol_distribution: BTreeMap<String, usize> = BTreeMap::new();
        for flow in flows {
            *protocol_distribution.entry(flow.protocol.to_string()).or_insert(0) += 1;
        }

        let mut durations: Vec<f64> = flows.iter().map(FlowRecord::duration).collect();
        durations.sort_by(|a, b| a.total_cmp(b));

        // Entropie de la distribution des nombres de paquets par flux
        let mut packet_count_freq: BTreeMap<u64, usize> = BTreeMap::new();
        for flow in flows {
            *packet_count_freq.entry(flow.total_packets).or_insert(0) += 1;
        }
        let freq: Vec<usize> = packet_count_freq.values().copied().collect();

        json!({
            "total_flows": flows.len(),
            "total_bytes": total_bytes,
            "total_packets": total_packets,
            "top_destination_ports": self.top_ports(flows),
            "protocol_distribution": protocol_distribution,
            "duration": {
                "mean": mean(&durations),
                "median": percentile(&durations, 50.0),
                "p25": percentile(&durations, 25.0),
                "p75": percentile(&durations, 75.0),
                "p95": percentile(&durations, 95.0),
                "min": durations.first().copied().unwrap_or(0.0),
                "max": durations.last().copied().unwrap_or(0.0),
            },
            "packet_count_entropy": shannon_entropy(&freq),
        })
    }
}

impl FlowAnalyzer for FlowStatsAnalyzer {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn schema(&self) -> GroupSchema {
        GroupSchema {
            module: MODULE_NAME,
            presence_flag: None,
            columns: vec![
                ColumnSpec::new("duration", ColumnKind::Float),
                ColumnSpec::new("total_packets", ColumnKind::Int),
                ColumnSpec::new("total_bytes", ColumnKind::Int),
                ColumnSpec::new("mean_packet_size", ColumnKind::Float),
                ColumnSpec::new("protocol", ColumnKind::Text),
                ColumnSpec::new("protocol_code", ColumnKind::Int),
                ColumnSpec::new("src_port", ColumnKind::Int),
                ColumnSpec::new("dst_port", ColumnKind::Int),
            ],
            sentinel: vec![
                FeatureValue::Float(0.0),
                FeatureValue::Int(0),
                FeatureValue::Int(0),
                FeatureValue::Float(0.0),
                FeatureValue::Text(String::new()),
                FeatureValue::Int(0),
                FeatureValue::Int(0),
                FeatureValue::Int(0),
            ],
        }
    }

    fn analyze(&self, flows: &[FlowRecord]) -> Result<AnalyzerOutput> {
        let mut features = FeatureSet::new(MODULE_NAME);
        for flow in flows {
            features.push(&flow.flow_id, Self::flow_features(flow));
        }
        debug!("Statistiques calculées pour {} flux", features.len());

        Ok(AnalyzerOutput {
            summary: AnalyzerSummary {
                module_name: MODULE_NAME.to_string(),
                flow_count: features.len(),
                excluded_count: 0,
                aggregate_statistics: self.global_summary(flows),
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
    fn test_per_flow_features() {
        let mut f = flow("a", 443);
        f.total_bytes = 3000;
        f.total_packets = 3;
        f.end_time = f.start_time + 4.0;

        let output = FlowStatsAnalyzer::new(FlowStatsConfig::default()).analyze(&[f]).unwrap();
        let row = &output.features.rows[0];

        assert_eq!(row.flow_id, "a");
        assert_eq!(row.values[0], FeatureValue::Float(4.0));
        assert_eq!(row.values[3], FeatureValue::Float(1000.0));
        assert_eq!(row.values[4], FeatureValue::Text("TCP".to_string()));
        assert_eq!(row.values[5], FeatureValue::Int(6));
        assert_eq!(row.values[7], FeatureValue::Int(443));
    }

    #[test]
    fn test_zero_packet_flow_has_zero_mean_size() {
        let mut f = flow("empty", 80);
        f.total_packets = 0;
        f.total_bytes = 0;
        let output = FlowStatsAnalyzer::new(FlowStatsConfig::default()).analyze(&[f]).unwrap();
        assert_eq!(output.features.rows[0].values[3], FeatureValue::Float(0.0));
    }

    #[test]
    fn test_huge_counters_saturate() {
        let mut a = flow("a", 443);
        a.total_packets = u64::MAX;
        a.total_bytes = u64::MAX;
        let mut b = flow("b", 443);
        b.total_bytes = u64::MAX;

        let output = FlowStatsAnalyzer::new(FlowStatsConfig::default()).analyze(&[a, b]).unwrap();
        let row = &output.features.rows[0];
        assert_eq!(row.values[1], FeatureValue::Int(i64::MAX));
        assert_eq!(row.values[2], FeatureValue::Int(i64::MAX));
        assert_eq!(output.summary.aggregate_statistics["total_bytes"], u64::MAX);
    }

    #[test]
    fn test_global_summary() {
        let flows = vec![flow("a", 443), flow("b", 443), flow("c", 80), flow("d", 22)];
        let analyzer = FlowStatsAnalyzer::new(FlowStatsConfig { top_n_ports: 2 });
        let output = analyzer.analyze(&flows).unwrap();
        let stats = &output.summary.aggregate_statistics;

        assert_eq!(output.summary.flow_count, 4);
        assert_eq!(stats["total_flows"], 4);
        let ports = stats["top_destination_ports"].as_array().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0]["port"], 443);
        assert_eq!(ports[0]["flows"], 2);
        assert_eq!(ports[1]["port"], 22);
        assert_eq!(stats["protocol_distribution"]["TCP"], 4);
    }
}
