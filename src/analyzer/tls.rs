//! Empreintes de poignées de main TLS
//!
//! Seuls les flux porteurs d'une poignée de main capturée produisent une
//! ligne ; les autres reçoivent `has_tls=false` et les sentinelles du groupe
//! lors de l'agrégation.

use super::FlowAnalyzer;
use crate::error::Result;
use crate::models::{
    AnalyzerOutput, AnalyzerSummary, ColumnKind, ColumnSpec, FeatureSet, FeatureValue, FlowRecord, GroupSchema,
    TlsHandshake,
};
use log::debug;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

pub const MODULE_NAME: &str = "tls";

/// Longueur de l'empreinte rendue (caractères hexadécimaux)
const FINGERPRINT_LEN: usize = 32;

/// Valeurs GREASE (RFC 8701), ignorées dans l'empreinte
pub fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a
}

fn join_codes(values: &[u16]) -> String {
    values
        .iter()
        .filter(|&&v| !is_grease(v))
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Chaîne canonique `version,ciphers,extensions`, ordre d'origine conservé
pub fn canonical_string(handshake: &TlsHandshake) -> String {
    format!(
        "{},{},{}",
        handshake.version,
        join_codes(&handshake.cipher_suites),
        join_codes(&handshake.extensions)
    )
}

pub fn fingerprint(handshake: &TlsHandshake) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(handshake).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

fn version_name(version: u16) -> String {
    match version {
        0x0300 => "SSL 3.0".to_string(),
        0x0301 => "TLS 1.0".to_string(),
        0x0302 => "TLS 1.1".to_string(),
        0x0303 => "TLS 1.2".to_string(),
        0x0304 => "TLS 1.3".to_string(),
        other => format!("0x{:04x}", other),
    }
}

#[derive(Default)]
pub struct TlsAnalyzer;

impl TlsAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl FlowAnalyzer for TlsAnalyzer {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn schema(&self) -> GroupSchema {
        GroupSchema {
            module: MODULE_NAME,
            presence_flag: Some("has_tls"),
            columns: vec![
                ColumnSpec::new("tls_fingerprint", ColumnKind::Text),
                ColumnSpec::new("cipher_count", ColumnKind::Int),
                ColumnSpec::new("extension_count", ColumnKind::Int),
                ColumnSpec::new("cert_valid_days", ColumnKind::Int),
                ColumnSpec::new("has_sni", ColumnKind::Bool),
            ],
            sentinel: vec![
                FeatureValue::Text(String::new()),
                FeatureValue::Int(0),
                FeatureValue::Int(0),
                FeatureValue::Int(-1),
                FeatureValue::Bool(false),
            ],
        }
    }

    fn analyze(&self, flows: &[FlowRecord]) -> Result<AnalyzerOutput> {
        let mut features = FeatureSet::new(MODULE_NAME);
        let mut fingerprint_counts: HashMap<String, usize> = HashMap::new();
        let mut versions: BTreeMap<String, usize> = BTreeMap::new();
        let mut with_certificate = 0usize;

        for flow in flows {
            let handshake = match &flow.tls {
                Some(handshake) => handshake,
                None => continue,
            };

            let fp = fingerprint(handshake);
            let cert_valid_days = handshake
                .certificate
                .as_ref()
                .and_then(|cert| cert.valid_days())
                .unwrap_or(-1);
            if cert_valid_days >= 0 {
                with_certificate += 1;
            }

            *fingerprint_counts.entry(fp.clone()).or_insert(0) += 1;
            *versions.entry(version_name(handshake.version)).or_insert(0) += 1;

            features.push(
                &flow.flow_id,
                vec![
                    FeatureValue::Text(fp),
                    FeatureValue::Int(handshake.cipher_suites.iter().filter(|&&c| !is_grease(c)).count() as i64),
                    FeatureValue::Int(handshake.extensions.iter().filter(|&&e| !is_grease(e)).count() as i64),
                    FeatureValue::Int(cert_valid_days),
                    FeatureValue::Bool(handshake.sni.as_deref().is_some_and(|s| !s.is_empty())),
                ],
            );
        }

        let tls_flows = features.len();
        let seen_once = fingerprint_counts.values().filter(|&&c| c == 1).count();
        let suspicious_ratio = if tls_flows > 0 {
            seen_once as f64 / tls_flows as f64
        } else {
            0.0
        };
        // Égalités départagées par ordre lexicographique
        let most_common = fingerprint_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(fp, count)| json!({ "fingerprint": fp, "flows": count }));

        debug!("{} poignées de main TLS sur {} flux", tls_flows, flows.len());

        let aggregate_statistics = json!({
            "tls_flows": tls_flows,
            "non_tls_flows": flows.len() - tls_flows,
            "unique_fingerprints": fingerprint_counts.len(),
            "suspicious_fingerprint_ratio": suspicious_ratio,
            "most_common_fingerprint": most_common,
            "version_distribution": versions,
            "certificates_observed": with_certificate,
        });

        Ok(AnalyzerOutput {
            summary: AnalyzerSummary {
                module_name: MODULE_NAME.to_string(),
                flow_count: tls_flows,
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
    use crate::models::CertificateInfo;

    fn handshake() -> TlsHandshake {
        TlsHandshake {
            version: 0x0303,
            cipher_suites: vec![0x0a0a, 4865, 4866, 49195],
            selected_cipher: Some(4865),
            extensions: vec![0, 23, 65281, 0x1a1a, 10],
            sni: Some("example.com".to_string()),
            certificate: Some(CertificateInfo {
                issuer: Some("R3".to_string()),
                not_before: Some(0.0),
                not_after: Some(90.0 * 86_400.0),
            }),
        }
    }

    #[test]
    fn test_canonical_string_drops_grease() {
        assert_eq!(canonical_string(&handshake()), "771,4865-4866-49195,0-23-65281-10");
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_order_sensitive() {
        let a = fingerprint(&handshake());
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert_eq!(a, fingerprint(&handshake()));

        let mut reordered = handshake();
        reordered.cipher_suites.swap(1, 2);
        assert_ne!(a, fingerprint(&reordered));

        // Les champs hors empreinte n'ont pas d'effet
        let mut other_sni = handshake();
        other_sni.sni = None;
        assert_eq!(a, fingerprint(&other_sni));
    }

    #[test]
    fn test_only_handshake_flows_produce_rows() {
        let mut tls_flow = flow("tls", 443);
        tls_flow.tls = Some(handshake());
        let mut no_cert = flow("nocert", 8443);
        no_cert.tls = Some(TlsHandshake {
            certificate: None,
            sni: None,
            ..handshake()
        });

        let output = TlsAnalyzer::new().analyze(&[tls_flow, flow("plain", 443), no_cert]).unwrap();
        assert_eq!(output.features.len(), 2);

        let row = &output.features.rows[0];
        assert_eq!(row.values[1], FeatureValue::Int(3));
        assert_eq!(row.values[2], FeatureValue::Int(4));
        assert_eq!(row.values[3], FeatureValue::Int(90));
        assert_eq!(row.values[4], FeatureValue::Bool(true));

        let no_cert_row = &output.features.rows[1];
        assert_eq!(no_cert_row.values[3], FeatureValue::Int(-1));
        assert_eq!(no_cert_row.values[4], FeatureValue::Bool(false));

        let stats = &output.summary.aggregate_statistics;
        assert_eq!(stats["tls_flows"], 2);
        assert_eq!(stats["non_tls_flows"], 1);
        assert_eq!(stats["unique_fingerprints"], 1);
        assert_eq!(stats["suspicious_fingerprint_ratio"], 0.0);
        assert_eq!(stats["most_common_fingerprint"]["flows"], 2);
    }

    #[test]
    fn test_grease_detection() {
        assert!(is_grease(0x0a0a));
        assert!(is_grease(0xfafa));
        assert!(!is_grease(0x1301));
    }
}
