//! Chargement et normalisation des flux
//!
//! Lit une table CSV de flux (ordre de colonnes libre, colonnes optionnelles
//! tolérées), valide chaque ligne contre un schéma explicite et produit des
//! `FlowRecord` normalisés. Une ligne invalide est rejetée et comptée, jamais
//! fatale ; seul un jeu de données sans aucune ligne valide interrompt le chargement.

use crate::error::{PipelineError, Result, RowRejection};
use crate::models::{CertificateInfo, FlowRecord, Label, Protocol, TlsHandshake};
use chrono::DateTime;
use csv::{ReaderBuilder, StringRecord, Trim};
use log::{debug, info, warn};
use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

/// Alias de colonnes hérités des exports de flux courants
const COLUMN_ALIASES: &[(&str, &str)] = &[
    ("source_ip", "src_ip"),
    ("destination_ip", "dst_ip"),
    ("source_port", "src_port"),
    ("destination_port", "dst_port"),
    ("protocol_type", "protocol"),
    ("flow_duration", "duration"),
    ("byte_count", "total_bytes"),
    ("packet_count", "total_packets"),
    ("timestamps", "packet_timestamps"),
    ("sizes", "packet_sizes"),
];

const MANDATORY_COLUMNS: &[&str] = &["src_ip", "dst_ip", "src_port", "dst_port", "protocol", "start_time"];

/// Bilan du chargement
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub total_rows: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Nombre de rejets par raison
    pub rejections: BTreeMap<String, usize>,
    pub has_label_column: bool,
}

impl LoadReport {
    fn reject(&mut self, line: usize, rejection: &RowRejection) {
        debug!("Ligne {} rejetée: {}", line, rejection);
        self.rejected += 1;
        *self.rejections.entry(rejection.reason_key()).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone)]
pub struct LoadedFlows {
    pub flows: Vec<FlowRecord>,
    pub report: LoadReport,
}

/// Position des colonnes connues dans l'en-tête
struct ColumnIndex {
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut positions = HashMap::new();
        for (idx, header) in headers.iter().enumerate() {
            let name = header.trim().to_lowercase();
            let canonical = COLUMN_ALIASES
                .iter()
                .find(|(alias, _)| *alias == name)
                .map(|(_, target)| target.to_string())
                .unwrap_or(name);
            // La première occurrence l'emporte
            positions.entry(canonical).or_insert(idx);
        }
        Self { positions }
    }

    fn has(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Valeur non vide d'une colonne, None si absente ou vide
    fn get<'r>(&self, record: &'r StringRecord, name: &str) -> Option<&'r str> {
        self.positions
            .get(name)
            .and_then(|&idx| record.get(idx))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Charge un fichier CSV de flux
pub fn load_path(path: &Path) -> Result<LoadedFlows> {
    let file = File::open(path)?;
    info!("Chargement des flux depuis {}", path.display());
    load_reader(file)
}

/// Charge des flux depuis n'importe quelle source CSV
pub fn load_reader<R: Read>(reader: R) -> Result<LoadedFlows> {
    let mut csv_reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let columns = ColumnIndex::from_headers(&headers);

    for column in MANDATORY_COLUMNS {
        if !columns.has(column) {
            return Err(PipelineError::MissingColumn(column.to_string()));
        }
    }
    if !columns.has("end_time") && !columns.has("duration") {
        return Err(PipelineError::MissingColumn("end_time|duration".to_string()));
    }

    let mut report = LoadReport {
        has_label_column: columns.has("label"),
        ..LoadReport::default()
    };
    let mut flows = Vec::new();
    let mut seen_ids = HashSet::new();

    for (idx, result) in csv_reader.records().enumerate() {
        // Ligne 1 = en-tête
        let line = idx + 2;
        report.total_rows += 1;

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                report.reject(line, &RowRejection::Malformed(e.to_string()));
                continue;
            }
        };

        match parse_row(&record, &columns) {
            Ok(flow) => {
                if !seen_ids.insert(flow.flow_id.clone()) {
                    report.reject(line, &RowRejection::DuplicateFlowId(flow.flow_id));
                    continue;
                }
                flows.push(flow);
            }
            Err(rejection) => report.reject(line, &rejection),
        }
    }

    report.accepted = flows.len();

    if report.rejected > 0 {
        warn!(
            "{} ligne(s) rejetée(s) sur {}: {:?}",
            report.rejected.to_formatted_string(&Locale::fr),
            report.total_rows.to_formatted_string(&Locale::fr),
            report.rejections
        );
    }

    if flows.is_empty() {
        return Err(PipelineError::EmptyDataset {
            rejected: report.rejected,
        });
    }

    info!(
        "{} flux valides chargés",
        report.accepted.to_formatted_string(&Locale::fr)
    );

    Ok(LoadedFlows { flows, report })
}

fn parse_row(record: &StringRecord, columns: &ColumnIndex) -> std::result::Result<FlowRecord, RowRejection> {
    let src_raw = columns.get(record, "src_ip").ok_or(RowRejection::MissingField("src_ip"))?;
    let dst_raw = columns.get(record, "dst_ip").ok_or(RowRejection::MissingField("dst_ip"))?;
    let src_ip = canonicalize_ip(src_raw).ok_or_else(|| RowRejection::InvalidIp(src_raw.to_string()))?;
    let dst_ip = canonicalize_ip(dst_raw).ok_or_else(|| RowRejection::InvalidIp(dst_raw.to_string()))?;

    let src_port = parse_required::<u16>(record, columns, "src_port")?;
    let dst_port = parse_required::<u16>(record, columns, "dst_port")?;

    let protocol_raw = columns.get(record, "protocol").ok_or(RowRejection::MissingField("protocol"))?;
    let protocol = Protocol::parse(protocol_raw).ok_or(RowRejection::MissingField("protocol"))?;

    let start_raw = columns.get(record, "start_time").ok_or(RowRejection::MissingField("start_time"))?;
    let start_time = parse_timestamp(start_raw).ok_or_else(|| RowRejection::InvalidValue {
        field: "start_time",
        value: start_raw.to_string(),
    })?;

    let end_time = match columns.get(record, "end_time") {
        Some(raw) => parse_timestamp(raw).ok_or_else(|| RowRejection::InvalidValue {
            field: "end_time",
            value: raw.to_string(),
        })?,
        None => {
            let raw = columns.get(record, "duration").ok_or(RowRejection::MissingField("end_time"))?;
            let duration = raw.parse::<f64>().map_err(|_| RowRejection::InvalidValue {
                field: "duration",
                value: raw.to_string(),
            })?;
            start_time + duration
        }
    };

    if !end_time.is_finite() || end_time < start_time {
        return Err(RowRejection::EndBeforeStart);
    }

    let packet_timestamps = match columns.get(record, "packet_timestamps") {
        Some(raw) => parse_list(raw, parse_timestamp).ok_or_else(|| RowRejection::InvalidValue {
            field: "packet_timestamps",
            value: raw.to_string(),
        })?,
        None => Vec::new(),
    };
    if packet_timestamps.windows(2).any(|pair| pair[1] < pair[0]) {
        return Err(RowRejection::UnsortedTimestamps);
    }

    let packet_sizes = match columns.get(record, "packet_sizes") {
        Some(raw) => parse_list(raw, |item| item.parse::<u32>().ok()).ok_or_else(|| {
            RowRejection::InvalidValue {
                field: "packet_sizes",
                value: raw.to_string(),
            }
        })?,
        None => Vec::new(),
    };

    let total_packets = match parse_optional::<u64>(record, columns, "total_packets")? {
        Some(count) => count,
        None if !packet_sizes.is_empty() => packet_sizes.len() as u64,
        None => packet_timestamps.len() as u64,
    };
    let total_bytes = match parse_optional::<u64>(record, columns, "total_bytes")? {
        Some(bytes) => bytes,
        None => packet_sizes.iter().map(|&s| s as u64).sum(),
    };

    let flow_id = match columns.get(record, "flow_id") {
        Some(id) => id.to_string(),
        None => format!("{}-{}-{}-{}-{}", src_ip, dst_ip, src_port, dst_port, protocol),
    };

    let tls = parse_tls(record, columns)?;
    let label = columns.get(record, "label").map(Label::parse);

    Ok(FlowRecord {
        flow_id,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        start_time,
        end_time,
        packet_timestamps,
        packet_sizes,
        total_bytes,
        total_packets,
        tls,
        label,
    })
}

fn parse_tls(record: &StringRecord, columns: &ColumnIndex) -> std::result::Result<Option<TlsHandshake>, RowRejection> {
    let version_raw = columns.get(record, "tls_version");
    let ciphers_raw = columns.get(record, "cipher_suites");
    let extensions_raw = columns.get(record, "extensions");

    if version_raw.is_none() && ciphers_raw.is_none() && extensions_raw.is_none() {
        return Ok(None);
    }

    let version = match version_raw {
        Some(raw) => parse_tls_version(raw).ok_or_else(|| RowRejection::InvalidValue {
            field: "tls_version",
            value: raw.to_string(),
        })?,
        None => 0,
    };

    let cipher_suites = match ciphers_raw {
        Some(raw) => parse_list(raw, parse_u16_code).ok_or_else(|| RowRejection::InvalidValue {
            field: "cipher_suites",
            value: raw.to_string(),
        })?,
        None => Vec::new(),
    };
    let extensions = match extensions_raw {
        Some(raw) => parse_list(raw, parse_u16_code).ok_or_else(|| RowRejection::InvalidValue {
            field: "extensions",
            value: raw.to_string(),
        })?,
        None => Vec::new(),
    };

    let selected_cipher = match columns.get(record, "selected_cipher") {
        Some(raw) => Some(parse_u16_code(raw).ok_or_else(|| RowRejection::InvalidValue {
            field: "selected_cipher",
            value: raw.to_string(),
        })?),
        None => None,
    };

    let sni = columns.get(record, "sni").map(|s| s.trim_end_matches('.').to_lowercase());

    let issuer = columns.get(record, "cert_issuer").map(str::to_string);
    let not_before = columns.get(record, "cert_not_before").and_then(parse_timestamp);
    let not_after = columns.get(record, "cert_not_after").and_then(parse_timestamp);
    let certificate = if issuer.is_some() || not_before.is_some() || not_after.is_some() {
        Some(CertificateInfo {
            issuer,
            not_before,
            not_after,
        })
    } else {
        None
    };

    Ok(Some(TlsHandshake {
        version,
        cipher_suites,
        selected_cipher,
        extensions,
        sni,
        certificate,
    }))
}

fn parse_required<T: FromStr>(
    record: &StringRecord,
    columns: &ColumnIndex,
    field: &'static str,
) -> std::result::Result<T, RowRejection> {
    let raw = columns.get(record, field).ok_or(RowRejection::MissingField(field))?;
    parse_number(raw).ok_or_else(|| RowRejection::InvalidValue {
        field,
        value: raw.to_string(),
    })
}

fn parse_optional<T: FromStr>(
    record: &StringRecord,
    columns: &ColumnIndex,
    field: &'static str,
) -> std::result::Result<Option<T>, RowRejection> {
    match columns.get(record, field) {
        Some(raw) => parse_number(raw).map(Some).ok_or_else(|| RowRejection::InvalidValue {
            field,
            value: raw.to_string(),
        }),
        None => Ok(None),
    }
}

/// Accepte aussi les entiers exportés en flottant ("443.0")
fn parse_number<T: FromStr>(raw: &str) -> Option<T> {
    raw.parse::<T>()
        .ok()
        .or_else(|| raw.strip_suffix(".0").and_then(|s| s.parse::<T>().ok()))
}

/// Canonicalise une adresse IP (crochets retirés, IPv4 mappée en IPv6 ramenée en IPv4)
pub fn canonicalize_ip(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    let ip = IpAddr::from_str(trimmed).ok()?;
    Some(ip.to_canonical())
}

/// Convertit un horodatage en secondes epoch
///
/// Les valeurs numériques sont ramenées en secondes selon leur ordre de
/// grandeur (ns, µs, ms) ; les chaînes RFC 3339 sont aussi acceptées.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<f64>() {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let seconds = if value > 1e17 {
            value / 1e9
        } else if value > 1e14 {
            value / 1e6
        } else if value > 1e11 {
            value / 1e3
        } else {
            value
        };
        return Some(seconds);
    }

    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp() as f64 + dt.timestamp_subsec_nanos() as f64 / 1e9)
}

/// Découpe une liste `[a;b;c]`, `a,b,c` ou `a b c`
pub fn parse_list<T, F>(raw: &str, parse_item: F) -> Option<Vec<T>>
where
    F: Fn(&str) -> Option<T>,
{
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(|c: char| c == ';' || c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_item(item.trim_matches(|c| c == '"' || c == '\'')))
        .collect()
}

/// Identifiant TLS 16 bits en décimal ou en hexadécimal (0x...)
pub fn parse_u16_code(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => raw.parse::<u16>().ok(),
    }
}

/// Version TLS sous forme de code sur le fil (771 = TLS 1.2)
pub fn parse_tls_version(raw: &str) -> Option<u16> {
    let normalized = raw
        .trim()
        .to_lowercase()
        .replace("tlsv", "")
        .replace("tls", "")
        .replace(' ', "");

    match normalized.as_str() {
        "1.3" => Some(0x0304),
        "1.2" => Some(0x0303),
        "1.1" => Some(0x0302),
        "1.0" | "1" => Some(0x0301),
        "ssl3" | "sslv3" | "3.0" => Some(0x0300),
        "unknown" => Some(0),
        other => parse_u16_code(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "flow_id,src_ip,dst_ip,src_port,dst_port,protocol,start_time,end_time,packet_timestamps,packet_sizes,label";

    fn load(body: &str) -> Result<LoadedFlows> {
        load_reader(format!("{}\n{}", HEADER, body).as_bytes())
    }

    #[test]
    fn test_valid_rows_are_normalized() {
        let loaded = load(
            "f1,10.0.0.1,::ffff:8.8.8.8,5000,443,tcp,1000,1002,1000;1001;1002,100;200;300,VPN\n",
        )
        .unwrap();

        assert_eq!(loaded.flows.len(), 1);
        let flow = &loaded.flows[0];
        assert_eq!(flow.dst_ip, "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(flow.protocol, Protocol::Tcp);
        assert_eq!(flow.total_packets, 3);
        assert_eq!(flow.total_bytes, 600);
        assert_eq!(flow.label, Some(Label::Vpn));
        assert!(loaded.report.has_label_column);
    }

    #[test]
    fn test_bad_rows_are_counted_not_fatal() {
        let loaded = load(
            "f1,10.0.0.1,10.0.0.2,1,2,udp,10,12,,,\n\
             f2,not-an-ip,10.0.0.2,1,2,udp,10,12,,,\n\
             f3,10.0.0.1,10.0.0.2,1,2,udp,10,5,,,\n\
             f4,10.0.0.1,10.0.0.2,1,2,udp,10,12,3;2,,\n\
             f1,10.0.0.1,10.0.0.2,1,2,udp,10,12,,,\n\
             f6,10.0.0.1,10.0.0.2,99999,2,udp,10,12,,,\n",
        )
        .unwrap();

        assert_eq!(loaded.report.total_rows, 6);
        assert_eq!(loaded.report.accepted, 1);
        assert_eq!(loaded.report.rejected, 5);
        assert_eq!(loaded.report.rejections.get("invalid_ip"), Some(&1));
        assert_eq!(loaded.report.rejections.get("end_before_start"), Some(&1));
        assert_eq!(loaded.report.rejections.get("unsorted_timestamps"), Some(&1));
        assert_eq!(loaded.report.rejections.get("duplicate_flow_id"), Some(&1));
        assert_eq!(loaded.report.rejections.get("invalid_src_port"), Some(&1));
    }

    #[test]
    fn test_zero_valid_rows_is_empty_dataset() {
        let err = load("f1,bad,10.0.0.2,1,2,udp,10,12,,,\n").unwrap_err();
        assert!(matches!(err, PipelineError::EmptyDataset { rejected: 1 }));
    }

    #[test]
    fn test_missing_mandatory_column_is_fatal() {
        let err = load_reader("src_ip,dst_ip,src_port,dst_port,start_time,end_time\n".as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn(ref c) if c == "protocol"));
    }

    #[test]
    fn test_aliases_duration_and_synthesized_flow_id() {
        let csv = "source_ip,destination_ip,source_port,destination_port,protocol_type,start_time,flow_duration,byte_count,packet_count\n\
                   192.168.1.2,1.1.1.1,5353,53,17,1700000000000,2.5,900,3\n";
        let loaded = load_reader(csv.as_bytes()).unwrap();
        let flow = &loaded.flows[0];

        assert_eq!(flow.flow_id, "192.168.1.2-1.1.1.1-5353-53-UDP");
        assert_eq!(flow.start_time, 1_700_000_000.0);
        assert_eq!(flow.duration(), 2.5);
        assert_eq!(flow.total_bytes, 900);
        assert_eq!(flow.total_packets, 3);
        assert!(!loaded.report.has_label_column);
    }

    #[test]
    fn test_tls_columns() {
        let csv = "flow_id,src_ip,dst_ip,src_port,dst_port,protocol,start_time,end_time,tls_version,cipher_suites,extensions,sni,cert_not_before,cert_not_after\n\
                   t1,10.0.0.1,1.2.3.4,5000,443,TCP,0,1,TLSv1.2,\"[0x1301,49195]\",0;11;10,Example.COM.,2024-01-01T00:00:00Z,2024-03-31T00:00:00Z\n";
        let loaded = load_reader(csv.as_bytes()).unwrap();
        let tls = loaded.flows[0].tls.as_ref().unwrap();

        assert_eq!(tls.version, 771);
        assert_eq!(tls.cipher_suites, vec![0x1301, 49195]);
        assert_eq!(tls.extensions, vec![0, 11, 10]);
        assert_eq!(tls.sni.as_deref(), Some("example.com"));
        assert_eq!(tls.certificate.as_ref().unwrap().valid_days(), Some(90));
    }

    #[test]
    fn test_timestamp_units() {
        assert_eq!(parse_timestamp("1700000000"), Some(1_700_000_000.0));
        assert_eq!(parse_timestamp("1700000000000"), Some(1_700_000_000.0));
        assert_eq!(parse_timestamp("1700000000000000"), Some(1_700_000_000.0));
        assert_eq!(parse_timestamp("1700000000000000000"), Some(1_700_000_000.0));
        assert_eq!(parse_timestamp("1970-01-01T00:00:10Z"), Some(10.0));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
