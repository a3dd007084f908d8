//! Jointure des caractéristiques par flux
//!
//! La table des statistiques de flux fait autorité sur l'univers des lignes :
//! chaque flux normalisé y figure exactement une fois. Les contributions des
//! autres analyseurs sont jointes par `flow_id` ; une contribution manquante
//! (analyseur indisponible, flux exclu, pas de poignée de main) est remplacée
//! par les sentinelles du groupe et signalée par le drapeau `has_<groupe>`.

use crate::config::AggregatorConfig;
use crate::error::{PipelineError, Result};
use crate::models::{ColumnKind, ColumnSpec, FeatureSet, FeatureValue, FlowRecord, GroupSchema, Label};
use csv::{ReaderBuilder, WriterBuilder};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

pub const FLOW_ID_COLUMN: &str = "flow_id";
pub const LABEL_COLUMN: &str = "label";

/// Contribution d'un analyseur ; `features` vaut None si l'étape est indisponible
#[derive(Debug, Clone)]
pub struct GroupContribution {
    pub schema: GroupSchema,
    pub features: Option<FeatureSet>,
}

impl GroupContribution {
    pub fn available(schema: GroupSchema, features: FeatureSet) -> Self {
        Self {
            schema,
            features: Some(features),
        }
    }

    pub fn unavailable(schema: GroupSchema) -> Self {
        Self { schema, features: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    pub flow_id: String,
    pub values: Vec<FeatureValue>,
    pub label: Option<Label>,
}

/// Bilan de la jointure par groupe
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationReport {
    /// Lignes effectivement jointes
    pub present: BTreeMap<String, usize>,
    /// Lignes complétées par les sentinelles
    pub filled: BTreeMap<String, usize>,
    /// Lignes d'analyseur dont le flow_id est inconnu de la table de base
    pub orphans: BTreeMap<String, usize>,
    pub unavailable_groups: Vec<String>,
}

/// Table prête pour l'apprentissage
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTable {
    /// Colonnes de caractéristiques (hors flow_id et label)
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<AggregatedRow>,
    pub has_label_column: bool,
    pub report: AggregationReport,
}

impl AggregatedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Valeur d'une colonne pour une ligne donnée
    pub fn value(&self, row: usize, column: &str) -> Option<&FeatureValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.values.get(idx))
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        self.write_to(file)?;
        info!("Table ML écrite dans {} ({} lignes)", path.display(), self.rows.len());
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = WriterBuilder::new().from_writer(writer);

        let mut header: Vec<&str> = vec![FLOW_ID_COLUMN];
        header.extend(self.columns.iter().map(|c| c.name.as_str()));
        if self.has_label_column {
            header.push(LABEL_COLUMN);
        }
        csv_writer.write_record(&header)?;

        for row in &self.rows {
            let mut record: Vec<String> = Vec::with_capacity(header.len());
            record.push(row.flow_id.clone());
            record.extend(row.values.iter().map(FeatureValue::to_field));
            if self.has_label_column {
                record.push(row.label.unwrap_or(Label::Unknown).as_str().to_string());
            }
            csv_writer.write_record(&record)?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::read_from(file)
    }

    /// Relit une table écrite par `write_to` ; le type de chaque colonne est déduit des valeurs
    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = ReaderBuilder::new().from_reader(reader);
        let headers = csv_reader.headers()?.clone();

        let flow_id_idx = headers
            .iter()
            .position(|h| h == FLOW_ID_COLUMN)
            .ok_or_else(|| PipelineError::MissingColumn(FLOW_ID_COLUMN.to_string()))?;
        let label_idx = headers.iter().position(|h| h == LABEL_COLUMN);
        let feature_idx: Vec<usize> = (0..headers.len())
            .filter(|&i| i != flow_id_idx && Some(i) != label_idx)
            .collect();

        let mut records = Vec::new();
        for result in csv_reader.records() {
            records.push(result?);
        }

        let columns: Vec<ColumnSpec> = feature_idx
            .iter()
            .map(|&i| {
                let values = records.iter().map(|r| r.get(i).unwrap_or(""));
                ColumnSpec::new(&headers[i], infer_kind(values))
            })
            .collect();

        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            let mut values = Vec::with_capacity(columns.len());
            for (spec, &i) in columns.iter().zip(&feature_idx) {
                let raw = record.get(i).unwrap_or("");
                let value = FeatureValue::parse_field(raw, spec.kind).ok_or_else(|| {
                    PipelineError::AggregationInvariant(format!("valeur illisible '{}' dans {}", raw, spec.name))
                })?;
                values.push(value);
            }
            rows.push(AggregatedRow {
                flow_id: record.get(flow_id_idx).unwrap_or("").to_string(),
                values,
                label: label_idx.and_then(|i| record.get(i)).map(Label::parse),
            });
        }

        Ok(Self {
            columns,
            rows,
            has_label_column: label_idx.is_some(),
            report: AggregationReport::default(),
        })
    }
}

fn infer_kind<'a>(values: impl Iterator<Item = &'a str> + Clone) -> ColumnKind {
    let mut values = values.map(str::trim);
    if values.clone().all(|v| v == "true" || v == "false") {
        ColumnKind::Bool
    } else if values.clone().all(|v| v.parse::<i64>().is_ok()) {
        ColumnKind::Int
    } else if values.all(|v| v.parse::<f64>().is_ok()) {
        ColumnKind::Float
    } else {
        ColumnKind::Text
    }
}

pub struct Aggregator {
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    /// Jointure externe de toutes les contributions contre la table de base
    pub fn aggregate(
        &self,
        flows: &[FlowRecord],
        has_label_column: bool,
        base: &GroupContribution,
        groups: &[GroupContribution],
    ) -> Result<AggregatedTable> {
        let base_features = base.features.as_ref().ok_or_else(|| {
            PipelineError::AggregationInvariant(format!("table de base {} indisponible", base.schema.module))
        })?;
        check_widths(&base.schema, base_features)?;

        let labels: HashMap<&str, Option<Label>> = flows.iter().map(|f| (f.flow_id.as_str(), f.label)).collect();
        let mut report = AggregationReport::default();

        let mut base_ids = HashSet::new();
        let mut rows = Vec::with_capacity(base_features.len());
        for row in &base_features.rows {
            if !base_ids.insert(row.flow_id.as_str()) {
                return Err(PipelineError::AggregationInvariant(format!(
                    "flow_id en double dans la table de base: {}",
                    row.flow_id
                )));
            }
            rows.push(AggregatedRow {
                flow_id: row.flow_id.clone(),
                values: row.values.clone(),
                label: labels.get(row.flow_id.as_str()).copied().flatten(),
            });
        }

        let mut columns = base.schema.columns.clone();

        for group in groups {
            let module = group.schema.module.to_string();
            if let Some(flag) = group.schema.presence_flag {
                columns.push(ColumnSpec::new(flag, ColumnKind::Bool));
            }
            columns.extend(group.schema.columns.iter().cloned());

            let by_id: HashMap<&str, &Vec<FeatureValue>> = match &group.features {
                Some(features) => {
                    check_widths(&group.schema, features)?;
                    let mut by_id = HashMap::with_capacity(features.len());
                    let mut orphans = 0usize;
                    for row in &features.rows {
                        if !base_ids.contains(row.flow_id.as_str()) {
                            orphans += 1;
                            continue;
                        }
                        if by_id.insert(row.flow_id.as_str(), &row.values).is_some() {
                            return Err(PipelineError::AggregationInvariant(format!(
                                "flow_id en double dans le groupe {}: {}",
                                module, row.flow_id
                            )));
                        }
                    }
                    if orphans > 0 {
                        warn!("Groupe {}: {} ligne(s) sans flux de base ignorée(s)", module, orphans);
                        report.orphans.insert(module.clone(), orphans);
                    }
                    by_id
                }
                None => {
                    report.unavailable_groups.push(module.clone());
                    HashMap::new()
                }
            };

            let mut present = 0usize;
            for row in rows.iter_mut() {
                let contribution = by_id.get(row.flow_id.as_str());
                if group.schema.presence_flag.is_some() {
                    row.values.push(FeatureValue::Bool(contribution.is_some()));
                }
                match contribution {
                    Some(values) => {
                        present += 1;
                        row.values.extend(values.iter().cloned());
                    }
                    None => row.values.extend(group.schema.sentinel.iter().cloned()),
                }
            }
            report.present.insert(module.clone(), present);
            report.filled.insert(module, rows.len() - present);
        }

        if rows.len() != base_features.len() {
            return Err(PipelineError::AggregationInvariant(format!(
                "{} lignes produites pour {} flux de base",
                rows.len(),
                base_features.len()
            )));
        }

        let mut table = AggregatedTable {
            columns,
            rows,
            has_label_column,
            report,
        };
        if self.config.normalize {
            normalize(&mut table);
        }
        debug!(
            "Agrégation: {} lignes, {} colonnes",
            table.rows.len(),
            table.columns.len()
        );
        Ok(table)
    }
}

fn check_widths(schema: &GroupSchema, features: &FeatureSet) -> Result<()> {
    if schema.sentinel.len() != schema.columns.len() {
        return Err(PipelineError::AggregationInvariant(format!(
            "groupe {}: {} sentinelles pour {} colonnes",
            schema.module,
            schema.sentinel.len(),
            schema.columns.len()
        )));
    }
    if let Some(row) = features.rows.iter().find(|r| r.values.len() != schema.columns.len()) {
        return Err(PipelineError::AggregationInvariant(format!(
            "groupe {}: ligne {} de largeur {} au lieu de {}",
            schema.module,
            row.flow_id,
            row.values.len(),
            schema.columns.len()
        )));
    }
    Ok(())
}

/// Normalisation min-max des colonnes continues (une colonne constante vaut 0)
fn normalize(table: &mut AggregatedTable) {
    for (idx, column) in table.columns.iter().enumerate() {
        if column.kind != ColumnKind::Float {
            continue;
        }
        let values: Vec<f64> = table.rows.iter().filter_map(|r| r.values[idx].as_f64()).collect();
        let low = values.iter().copied().fold(f64::INFINITY, f64::min);
        let high = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = high - low;

        for row in table.rows.iter_mut() {
            if let FeatureValue::Float(v) = row.values[idx] {
                row.values[idx] = FeatureValue::Float(if range > 0.0 { (v - low) / range } else { 0.0 });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::test_support::flow;
    use crate::analyzer::{FlowAnalyzer, FlowStatsAnalyzer, SizeAnalyzer, TlsAnalyzer};
    use crate::config::{FlowStatsConfig, SizeConfig};
    use crate::models::TlsHandshake;

    fn flows() -> Vec<FlowRecord> {
        let mut a = flow("a", 443);
        a.packet_sizes = vec![100, 1400];
        a.tls = Some(TlsHandshake {
            version: 0x0303,
            cipher_suites: vec![4865],
            ..TlsHandshake::default()
        });
        a.label = Some(Label::Vpn);
        let mut b = flow("b", 80);
        b.label = Some(Label::NonVpn);
        vec![a, b]
    }

    fn contributions(flows: &[FlowRecord]) -> (GroupContribution, Vec<GroupContribution>) {
        let base = FlowStatsAnalyzer::new(FlowStatsConfig::default());
        let size = SizeAnalyzer::new(SizeConfig::default());
        let tls = TlsAnalyzer::new();
        (
            GroupContribution::available(base.schema(), base.analyze(flows).unwrap().features),
            vec![
                GroupContribution::available(size.schema(), size.analyze(flows).unwrap().features),
                GroupContribution::available(tls.schema(), tls.analyze(flows).unwrap().features),
            ],
        )
    }

    #[test]
    fn test_missing_contributions_get_sentinels() {
        let flows = flows();
        let (base, groups) = contributions(&flows);
        let table = Aggregator::new(AggregatorConfig::default())
            .aggregate(&flows, true, &base, &groups)
            .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.value(0, "has_tls"), Some(&FeatureValue::Bool(true)));
        assert_eq!(table.value(1, "has_tls"), Some(&FeatureValue::Bool(false)));
        assert_eq!(table.value(1, "tls_fingerprint"), Some(&FeatureValue::Text(String::new())));
        assert_eq!(table.value(1, "cert_valid_days"), Some(&FeatureValue::Int(-1)));
        assert_eq!(table.value(1, "has_size"), Some(&FeatureValue::Bool(false)));
        assert_eq!(table.rows[1].label, Some(Label::NonVpn));
        assert_eq!(table.report.filled["tls"], 1);
    }

    #[test]
    fn test_unavailable_group_keeps_all_rows() {
        let flows = flows();
        let (base, mut groups) = contributions(&flows);
        groups[1] = GroupContribution::unavailable(TlsAnalyzer::new().schema());

        let table = Aggregator::new(AggregatorConfig::default())
            .aggregate(&flows, true, &base, &groups)
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.value(0, "has_tls"), Some(&FeatureValue::Bool(false)));
        assert_eq!(table.report.unavailable_groups, vec!["tls".to_string()]);
    }

    #[test]
    fn test_orphan_rows_are_counted() {
        let flows = flows();
        let (base, mut groups) = contributions(&flows);
        let sentinel = groups[0].schema.sentinel.clone();
        if let Some(features) = groups[0].features.as_mut() {
            features.push("ghost", sentinel);
        }

        let table = Aggregator::new(AggregatorConfig::default())
            .aggregate(&flows, true, &base, &groups)
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.report.orphans["size"], 1);
    }

    #[test]
    fn test_wrong_width_is_an_invariant_error() {
        let flows = flows();
        let (base, mut groups) = contributions(&flows);
        if let Some(features) = groups[0].features.as_mut() {
            features.rows[0].values.pop();
        }
        let result = Aggregator::new(AggregatorConfig::default()).aggregate(&flows, true, &base, &groups);
        assert!(matches!(result, Err(PipelineError::AggregationInvariant(_))));
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let flows = flows();
        let (base, groups) = contributions(&flows);
        let aggregator = Aggregator::new(AggregatorConfig::default());
        let first = aggregator.aggregate(&flows, true, &base, &groups).unwrap();
        let second = aggregator.aggregate(&flows, true, &base, &groups).unwrap();
        assert_eq!(first, second);

        let mut a = Vec::new();
        let mut b = Vec::new();
        first.write_to(&mut a).unwrap();
        second.write_to(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_csv_read_back() {
        let flows = flows();
        let (base, groups) = contributions(&flows);
        let table = Aggregator::new(AggregatorConfig::default())
            .aggregate(&flows, true, &base, &groups)
            .unwrap();

        let mut buffer = Vec::new();
        table.write_to(&mut buffer).unwrap();
        let reloaded = AggregatedTable::read_from(buffer.as_slice()).unwrap();

        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.has_label_column);
        assert_eq!(reloaded.rows[0].label, Some(Label::Vpn));
        let names: Vec<&str> = reloaded.columns.iter().map(|c| c.name.as_str()).collect();
        let expected: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, expected);
        assert_eq!(reloaded.value(1, "has_tls"), Some(&FeatureValue::Bool(false)));
    }

    #[test]
    fn test_normalization_scales_float_columns() {
        let mut flows = flows();
        flows[1].end_time = flows[1].start_time + 3.0;
        let (base, groups) = contributions(&flows);
        let table = Aggregator::new(AggregatorConfig { normalize: true })
            .aggregate(&flows, false, &base, &groups)
            .unwrap();

        assert_eq!(table.value(0, "duration"), Some(&FeatureValue::Float(0.0)));
        assert_eq!(table.value(1, "duration"), Some(&FeatureValue::Float(1.0)));
        assert_eq!(table.value(0, "dst_port"), Some(&FeatureValue::Int(443)));
    }
}
