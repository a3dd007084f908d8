//! Score de réputation des extrémités d'un flux
//!
//! Les listes de référence (IPs/CIDR/domaines malveillants, sorties VPN
//! connues, infrastructures de confiance) sont chargées une seule fois au
//! démarrage de l'étape puis passées au scoreur sous forme immuable. Si la
//! liste est indisponible ou vide, le scoreur passe en mode neutre : chaque
//! flux reçoit le score neutre et l'étape est signalée comme dégradée.

use super::{mean, FlowAnalyzer};
use crate::config::ReputationConfig;
use crate::error::{PipelineError, Result};
use crate::models::{
    AnalyzerOutput, AnalyzerSummary, ColumnKind, ColumnSpec, FeatureSet, FeatureValue, FlowRecord, GroupSchema,
};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

pub const MODULE_NAME: &str = "reputation";

/// Catégorie d'une entrée de liste de référence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThreatCategory {
    Malicious,
    VpnExit,
    Trusted,
}

impl ThreatCategory {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "malicious" | "threat" | "malware" => Some(Self::Malicious),
            "vpn" | "vpn_exit" | "vpn_ip" => Some(Self::VpnExit),
            "trusted" | "allow" | "allowlist" => Some(Self::Trusted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malicious => "malicious",
            Self::VpnExit => "vpn_exit",
            Self::Trusted => "trusted",
        }
    }
}

/// Liste de référence immuable
#[derive(Debug, Clone, Default)]
pub struct ThreatList {
    pub version: String,
    ips: HashMap<IpAddr, Vec<ThreatCategory>>,
    cidrs: Vec<(IpNetwork, ThreatCategory)>,
    domains: HashMap<String, Vec<ThreatCategory>>,
    /// Lignes ignorées car illisibles
    pub skipped_lines: usize,
}

impl ThreatList {
    /// Analyse le format texte `<ip|cidr|domaine> <catégorie>` (commentaires `#`)
    pub fn parse(content: &str) -> Self {
        let mut list = ThreatList {
            version: "unversioned".to_string(),
            ..ThreatList::default()
        };

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                if let Some(version) = comment.trim().strip_prefix("version:") {
                    list.version = version.trim().to_string();
                }
                continue;
            }

            let mut parts = line.split(|c: char| c.is_whitespace() || c == ',').filter(|p| !p.is_empty());
            let (value, category) = match (parts.next(), parts.next().and_then(ThreatCategory::parse)) {
                (Some(value), Some(category)) => (value, category),
                _ => {
                    warn!("Liste de réputation: ligne {} ignorée ('{}')", idx + 1, line);
                    list.skipped_lines += 1;
                    continue;
                }
            };
            list.insert(value, category);
        }

        list
    }

    fn insert(&mut self, value: &str, category: ThreatCategory) {
        if value.contains('/') {
            match value.parse::<IpNetwork>() {
                Ok(network) => self.cidrs.push((network, category)),
                Err(_) => {
                    warn!("Liste de réputation: réseau invalide {}", value);
                    self.skipped_lines += 1;
                }
            }
        } else if let Ok(ip) = value.parse::<IpAddr>() {
            self.ips.entry(ip.to_canonical()).or_default().push(category);
        } else {
            let domain = value.trim_end_matches('.').to_lowercase();
            self.domains.entry(domain).or_default().push(category);
        }
    }

    pub fn len(&self) -> usize {
        self.ips.values().map(Vec::len).sum::<usize>()
            + self.cidrs.len()
            + self.domains.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Catégories correspondant à une IP (exacte ou CIDR)
    pub fn check_ip(&self, ip: &IpAddr) -> BTreeSet<ThreatCategory> {
        let mut matched = BTreeSet::new();
        if let Some(categories) = self.ips.get(ip) {
            matched.extend(categories.iter().copied());
        }
        for (network, category) in &self.cidrs {
            if network.contains(*ip) {
                matched.insert(*category);
            }
        }
        matched
    }

    /// Catégories correspondant à un domaine ou à l'un de ses parents
    pub fn check_domain(&self, domain: &str) -> BTreeSet<ThreatCategory> {
        let mut matched = BTreeSet::new();
        let domain = domain.trim_end_matches('.').to_lowercase();
        let parts: Vec<&str> = domain.split('.').collect();
        for i in 0..parts.len() {
            let candidate = parts[i..].join(".");
            if let Some(categories) = self.domains.get(&candidate) {
                matched.extend(categories.iter().copied());
            }
        }
        matched
    }
}

/// Fournisseur externe de la liste de référence
#[async_trait]
pub trait ThreatListSource: Send + Sync {
    async fn fetch(&self) -> Result<ThreatList>;

    fn describe(&self) -> String;
}

/// Liste lue depuis un fichier texte
pub struct FileThreatList {
    path: PathBuf,
}

impl FileThreatList {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ThreatListSource for FileThreatList {
    async fn fetch(&self) -> Result<ThreatList> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PipelineError::ThreatList(format!("{}: {}", self.path.display(), e)))?;
        let list = ThreatList::parse(&content);
        info!(
            "Liste de réputation {} chargée: {} entrées (version {})",
            self.path.display(),
            list.len(),
            list.version
        );
        Ok(list)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Liste déjà en mémoire
pub struct StaticThreatList(pub ThreatList);

#[async_trait]
impl ThreatListSource for StaticThreatList {
    async fn fetch(&self) -> Result<ThreatList> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        format!("liste statique ({} entrées)", self.0.len())
    }
}

/// Classe d'adresse d'une extrémité
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Private,
    Reserved,
    Public,
}

pub fn classify_ip(ip: &IpAddr) -> EndpointClass {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() || v4.is_loopback() || v4.is_link_local() {
                EndpointClass::Private
            } else if v4.is_multicast() || v4.is_broadcast() || v4.is_unspecified() || v4.is_documentation() {
                EndpointClass::Reserved
            } else {
                EndpointClass::Public
            }
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            if v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80 {
                EndpointClass::Private
            } else if v6.is_multicast() || v6.is_unspecified() {
                EndpointClass::Reserved
            } else {
                EndpointClass::Public
            }
        }
    }
}

/// Verdict de réputation d'un flux
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationVerdict {
    pub score: f64,
    pub is_known_vpn_ip: bool,
    pub matched_list: Option<ThreatCategory>,
    pub dst_is_private: bool,
}

pub struct ReputationScorer {
    config: ReputationConfig,
    list: Option<Arc<ThreatList>>,
    /// Raison du mode neutre, si la liste n'est pas exploitable
    neutral_reason: Option<String>,
}

impl ReputationScorer {
    pub fn new(config: ReputationConfig, list: Arc<ThreatList>) -> Self {
        if list.is_empty() {
            return Self::neutral(config, "liste de référence vide".to_string());
        }
        Self {
            config,
            list: Some(list),
            neutral_reason: None,
        }
    }

    /// Scoreur sans liste : chaque flux reçoit le score neutre
    pub fn neutral(config: ReputationConfig, reason: String) -> Self {
        warn!("Réputation en mode neutre: {}", reason);
        Self {
            config,
            list: None,
            neutral_reason: Some(reason),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.list.is_none()
    }

    pub fn score_flow(&self, flow: &FlowRecord) -> ReputationVerdict {
        let dst_is_private = classify_ip(&flow.dst_ip) == EndpointClass::Private;

        let list = match &self.list {
            Some(list) => list,
            None => {
                return ReputationVerdict {
                    score: self.config.neutral_score,
                    is_known_vpn_ip: false,
                    matched_list: None,
                    dst_is_private,
                }
            }
        };

        let mut ip_matches = list.check_ip(&flow.src_ip);
        ip_matches.extend(list.check_ip(&flow.dst_ip));

        let mut matches = ip_matches.clone();
        if let Some(sni) = flow.tls.as_ref().and_then(|tls| tls.sni.as_deref()) {
            matches.extend(list.check_domain(sni));
        }

        // BTreeSet trié selon la précédence malicious > vpn_exit > trusted
        let matched_list = matches.iter().next().copied();

        let score = if matches.is_empty() {
            self.config.neutral_score
        } else {
            let indicator = |category| if matches.contains(&category) { 1.0 } else { 0.0 };
            (self.config.neutral_score
                + self.config.vpn_weight * indicator(ThreatCategory::VpnExit)
                + self.config.malicious_weight * indicator(ThreatCategory::Malicious)
                - self.config.trusted_weight * indicator(ThreatCategory::Trusted))
            .clamp(0.0, 1.0)
        };

        ReputationVerdict {
            score,
            is_known_vpn_ip: ip_matches.contains(&ThreatCategory::VpnExit),
            matched_list,
            dst_is_private,
        }
    }

    fn summary(&self, flows: &[FlowRecord], verdicts: &[ReputationVerdict]) -> serde_json::Value {
        let mut unique_ips: BTreeSet<IpAddr> = BTreeSet::new();
        for flow in flows {
            unique_ips.insert(flow.src_ip);
            unique_ips.insert(flow.dst_ip);
        }

        let mut local_ips = 0;
        let mut reserved_ips = 0;
        let mut public_ips = 0;
        let mut vpn_like_ips = 0;
        let mut malicious_ips = 0;
        for ip in &unique_ips {
            match classify_ip(ip) {
                EndpointClass::Private => local_ips += 1,
                EndpointClass::Reserved => reserved_ips += 1,
                EndpointClass::Public => public_ips += 1,
            }
            if let Some(list) = &self.list {
                let matched = list.check_ip(ip);
                if matched.contains(&ThreatCategory::VpnExit) {
                    vpn_like_ips += 1;
                }
                if matched.contains(&ThreatCategory::Malicious) {
                    malicious_ips += 1;
                }
            }
        }

        let scores: Vec<f64> = verdicts.iter().map(|v| v.score).collect();
        json!({
            "neutral_mode": self.is_neutral(),
            "neutral_reason": self.neutral_reason,
            "list_version": self.list.as_ref().map(|l| l.version.clone()),
            "list_entries": self.list.as_ref().map(|l| l.len()).unwrap_or(0),
            "total_unique_ips": unique_ips.len(),
            "local_ips": local_ips,
            "reserved_ips": reserved_ips,
            "public_ips": public_ips,
            "vpn_like_ips": vpn_like_ips,
            "malicious_ips": malicious_ips,
            "flows_matched": verdicts.iter().filter(|v| v.matched_list.is_some()).count(),
            "mean_reputation_score": mean(&scores),
        })
    }
}

impl FlowAnalyzer for ReputationScorer {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn schema(&self) -> GroupSchema {
        GroupSchema {
            module: MODULE_NAME,
            presence_flag: Some("has_reputation"),
            columns: vec![
                ColumnSpec::new("reputation_score", ColumnKind::Float),
                ColumnSpec::new("is_known_vpn_ip", ColumnKind::Bool),
                ColumnSpec::new("matched_list", ColumnKind::Text),
                ColumnSpec::new("dst_is_private", ColumnKind::Bool),
            ],
            sentinel: vec![
                FeatureValue::Float(self.config.neutral_score),
                FeatureValue::Bool(false),
                FeatureValue::Text(String::new()),
                FeatureValue::Bool(false),
            ],
        }
    }

    fn analyze(&self, flows: &[FlowRecord]) -> Result<AnalyzerOutput> {
        let mut features = FeatureSet::new(MODULE_NAME);
        let mut verdicts = Vec::with_capacity(flows.len());

        for flow in flows {
            let verdict = self.score_flow(flow);
            features.push(
                &flow.flow_id,
                vec![
                    FeatureValue::Float(verdict.score),
                    FeatureValue::Bool(verdict.is_known_vpn_ip),
                    FeatureValue::Text(
                        verdict.matched_list.map(|c| c.as_str().to_string()).unwrap_or_default(),
                    ),
                    FeatureValue::Bool(verdict.dst_is_private),
                ],
            );
            verdicts.push(verdict);
        }
        debug!("Réputation évaluée pour {} flux", features.len());

        Ok(AnalyzerOutput {
            summary: AnalyzerSummary {
                module_name: MODULE_NAME.to_string(),
                flow_count: features.len(),
                excluded_count: 0,
                aggregate_statistics: self.summary(flows, &verdicts),
            },
            features,
            degraded: self.neutral_reason.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::test_support::flow;
    use crate::models::TlsHandshake;

    const LIST: &str = "# version: 2024-06\n\
                        198.51.100.0/24 vpn_exit\n\
                        203.0.113.7 malicious\n\
                        nordvpn.com vpn\n\
                        internal.example trusted\n\
                        garbage\n";

    fn scorer() -> ReputationScorer {
        ReputationScorer::new(ReputationConfig::default(), Arc::new(ThreatList::parse(LIST)))
    }

    #[test]
    fn test_parse_list() {
        let list = ThreatList::parse(LIST);
        assert_eq!(list.version, "2024-06");
        assert_eq!(list.len(), 4);
        assert_eq!(list.skipped_lines, 1);
        assert!(list.check_domain("us1.NordVPN.com").contains(&ThreatCategory::VpnExit));
        assert!(list.check_domain("nordvpn.com.evil.org").is_empty());
    }

    #[test]
    fn test_unmatched_endpoint_is_neutral() {
        let verdict = scorer().score_flow(&flow("a", 443));
        assert_eq!(verdict.score, 0.5);
        assert!(!verdict.is_known_vpn_ip);
        assert_eq!(verdict.matched_list, None);
    }

    #[test]
    fn test_cidr_vpn_match() {
        let mut f = flow("a", 1194);
        f.dst_ip = "198.51.100.20".parse().unwrap();
        let verdict = scorer().score_flow(&f);
        assert!(verdict.is_known_vpn_ip);
        assert_eq!(verdict.matched_list, Some(ThreatCategory::VpnExit));
        assert!((verdict.score - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_malicious_takes_precedence_and_clamps() {
        let mut f = flow("a", 443);
        f.src_ip = "203.0.113.7".parse().unwrap();
        f.dst_ip = "198.51.100.1".parse().unwrap();
        let verdict = scorer().score_flow(&f);
        assert_eq!(verdict.matched_list, Some(ThreatCategory::Malicious));
        assert_eq!(verdict.score, 1.0);
    }

    #[test]
    fn test_sni_domain_match_is_not_an_ip_match() {
        let mut f = flow("a", 443);
        f.tls = Some(TlsHandshake {
            sni: Some("de2.nordvpn.com".to_string()),
            ..TlsHandshake::default()
        });
        let verdict = scorer().score_flow(&f);
        assert_eq!(verdict.matched_list, Some(ThreatCategory::VpnExit));
        assert!(!verdict.is_known_vpn_ip);
    }

    #[test]
    fn test_empty_list_degrades_to_neutral() {
        let scorer = ReputationScorer::new(ReputationConfig::default(), Arc::new(ThreatList::parse("# rien\n")));
        let mut f = flow("a", 443);
        f.dst_ip = "198.51.100.20".parse().unwrap();
        let output = scorer.analyze(&[f, flow("b", 80)]).unwrap();

        assert!(output.degraded.is_some());
        for row in &output.features.rows {
            assert_eq!(row.values[0], FeatureValue::Float(0.5));
            assert_eq!(row.values[1], FeatureValue::Bool(false));
        }
        assert_eq!(output.summary.aggregate_statistics["neutral_mode"], true);
    }

    #[test]
    fn test_endpoint_classification() {
        assert_eq!(classify_ip(&"192.168.1.10".parse().unwrap()), EndpointClass::Private);
        assert_eq!(classify_ip(&"224.0.0.1".parse().unwrap()), EndpointClass::Reserved);
        assert_eq!(classify_ip(&"8.8.8.8".parse().unwrap()), EndpointClass::Public);
        assert_eq!(classify_ip(&"fd00::1".parse().unwrap()), EndpointClass::Private);
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let source = FileThreatList::new(PathBuf::from("/nonexistent/threats.txt"));
        assert!(matches!(source.fetch().await, Err(PipelineError::ThreatList(_))));
    }
}
