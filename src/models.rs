use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

/// Protocole de transport (ou applicatif) d'un flux
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// Nom de protocole non reconnu, conservé en majuscules
    Other(String),
}

impl Protocol {
    /// Normalise un nom ou un numéro IANA de protocole
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        if upper.is_empty() {
            return None;
        }

        let protocol = match upper.as_str() {
            "TCP" | "6" => Self::Tcp,
            "UDP" | "17" => Self::Udp,
            "ICMP" | "1" => Self::Icmp,
            _ => Self::Other(upper),
        };
        Some(protocol)
    }

    /// Numéro IANA du protocole, 0 si inconnu
    pub fn code(&self) -> i64 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Other(_) => 0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Étiquette de vérité terrain d'un flux
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    NonVpn,
    Vpn,
    Unknown,
}

impl Label {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "vpn" | "1" => Self::Vpn,
            "non-vpn" | "nonvpn" | "non_vpn" | "benign" | "0" => Self::NonVpn,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vpn => "vpn",
            Self::NonVpn => "non-vpn",
            Self::Unknown => "unknown",
        }
    }

    /// Indice de classe pour l'apprentissage supervisé (None pour `unknown`)
    pub fn class_index(&self) -> Option<usize> {
        match self {
            Self::NonVpn => Some(0),
            Self::Vpn => Some(1),
            Self::Unknown => None,
        }
    }

    pub fn from_class_index(index: usize) -> Self {
        match index {
            0 => Self::NonVpn,
            1 => Self::Vpn,
            _ => Self::Unknown,
        }
    }
}

/// Champs de certificat observés pendant la poignée de main
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CertificateInfo {
    pub issuer: Option<String>,
    pub not_before: Option<f64>,
    pub not_after: Option<f64>,
}

impl CertificateInfo {
    /// Durée de validité en jours entiers, si la fenêtre est connue
    pub fn valid_days(&self) -> Option<i64> {
        match (self.not_before, self.not_after) {
            (Some(start), Some(end)) if end >= start => Some(((end - start) / 86_400.0).floor() as i64),
            _ => None,
        }
    }
}

/// Poignée de main TLS capturée pour un flux
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TlsHandshake {
    /// Version sur le fil (0x0303 = 771 pour TLS 1.2)
    pub version: u16,
    pub cipher_suites: Vec<u16>,
    pub selected_cipher: Option<u16>,
    pub extensions: Vec<u16>,
    pub sni: Option<String>,
    pub certificate: Option<CertificateInfo>,
}

/// Conversation réseau bidirectionnelle normalisée
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRecord {
    pub flow_id: String,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// Secondes epoch
    pub start_time: f64,
    pub end_time: f64,
    pub packet_timestamps: Vec<f64>,
    pub packet_sizes: Vec<u32>,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub tls: Option<TlsHandshake>,
    pub label: Option<Label>,
}

impl FlowRecord {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Type d'une colonne de caractéristiques
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColumnKind {
    Float,
    Int,
    Bool,
    Text,
}

/// Valeur d'une caractéristique
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FeatureValue {
    /// Valeur numérique utilisable par les modèles (les booléens valent 0 ou 1)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Float(_) => ColumnKind::Float,
            Self::Int(_) => ColumnKind::Int,
            Self::Bool(_) => ColumnKind::Bool,
            Self::Text(_) => ColumnKind::Text,
        }
    }

    /// Représentation stable dans un champ CSV
    pub fn to_field(&self) -> String {
        match self {
            Self::Float(v) => format!("{}", v),
            Self::Int(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Text(v) => v.clone(),
        }
    }

    /// Relit un champ CSV selon le type attendu de la colonne
    pub fn parse_field(raw: &str, kind: ColumnKind) -> Option<Self> {
        let raw = raw.trim();
        match kind {
            ColumnKind::Float => raw.parse::<f64>().ok().map(Self::Float),
            ColumnKind::Int => raw.parse::<i64>().ok().map(Self::Int),
            ColumnKind::Bool => match raw {
                "true" | "1" => Some(Self::Bool(true)),
                "false" | "0" => Some(Self::Bool(false)),
                _ => None,
            },
            ColumnKind::Text => Some(Self::Text(raw.to_string())),
        }
    }
}

/// Nom et type d'une colonne
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Schéma d'un groupe de caractéristiques produit par un analyseur
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSchema {
    pub module: &'static str,
    /// Drapeau `has_<groupe>` ajouté par l'agrégateur (None pour la table de base)
    pub presence_flag: Option<&'static str>,
    pub columns: Vec<ColumnSpec>,
    /// Valeurs sentinelles documentées quand la contribution manque
    pub sentinel: Vec<FeatureValue>,
}

/// Caractéristiques d'un flux pour un analyseur
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureRow {
    pub flow_id: String,
    pub values: Vec<FeatureValue>,
}

/// Ensemble de caractéristiques indexé par flow_id, immuable une fois produit
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub module: &'static str,
    pub rows: Vec<FeatureRow>,
}

impl FeatureSet {
    pub fn new(module: &'static str) -> Self {
        Self {
            module,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, flow_id: &str, values: Vec<FeatureValue>) {
        self.rows.push(FeatureRow {
            flow_id: flow_id.to_string(),
            values,
        });
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Résumé JSON écrit pour chaque analyseur
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzerSummary {
    pub module_name: String,
    pub flow_count: usize,
    pub excluded_count: usize,
    pub aggregate_statistics: serde_json::Value,
}

/// Sortie complète d'une passe d'analyse
#[derive(Debug, Clone)]
pub struct AnalyzerOutput {
    pub features: FeatureSet,
    pub summary: AnalyzerSummary,
    /// Raison d'un fonctionnement dégradé (ex: liste de réputation indisponible)
    pub degraded: Option<String>,
}

/// Type de rapport émis par une étape
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReportType {
    /// Information générale
    Info,
    /// Avertissement (lignes rejetées, exclusions)
    Warning,
    /// Étape dégradée mais poursuivie
    Degraded,
    /// Échec d'une étape
    Failure,
}

/// Rapport d'étape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: SystemTime,
    pub report_type: ReportType,
    pub stage: String,
    pub message: String,
    pub details: Option<String>,
}

impl Report {
    pub fn new(report_type: ReportType, stage: &str, message: String) -> Self {
        Self {
            timestamp: SystemTime::now(),
            report_type,
            stage: stage.to_string(),
            message,
            details: None,
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!(Protocol::parse(" tcp "), Some(Protocol::Tcp));
        assert_eq!(Protocol::parse("17"), Some(Protocol::Udp));
        assert_eq!(Protocol::parse("tls"), Some(Protocol::Other("TLS".to_string())));
        assert_eq!(Protocol::parse(""), None);
        assert_eq!(Protocol::Icmp.code(), 1);
    }

    #[test]
    fn test_label_parse() {
        assert_eq!(Label::parse("VPN"), Label::Vpn);
        assert_eq!(Label::parse("Non-VPN"), Label::NonVpn);
        assert_eq!(Label::parse("tor"), Label::Unknown);
        assert_eq!(Label::Vpn.class_index(), Some(1));
        assert_eq!(Label::Unknown.class_index(), None);
    }

    #[test]
    fn test_certificate_valid_days() {
        let cert = CertificateInfo {
            issuer: Some("R3".to_string()),
            not_before: Some(0.0),
            not_after: Some(90.5 * 86_400.0),
        };
        assert_eq!(cert.valid_days(), Some(90));
        assert_eq!(CertificateInfo::default().valid_days(), None);
    }

    #[test]
    fn test_feature_value_fields() {
        assert_eq!(FeatureValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(FeatureValue::Text("x".to_string()).as_f64(), None);
        assert_eq!(FeatureValue::Float(0.5).to_field(), "0.5");
        assert_eq!(
            FeatureValue::parse_field("-1", ColumnKind::Int),
            Some(FeatureValue::Int(-1))
        );
        assert_eq!(FeatureValue::parse_field("maybe", ColumnKind::Bool), None);
    }
}
