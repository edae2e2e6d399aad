use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::LazyLock,
};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Number of [`RuleSyncData`] entries kept per sync record.
pub const SYNC_HISTORY_LIMIT: usize = 10;

static TSURU_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,39}$").expect("valid regex"));

const DNS1123_SUBDOMAIN_FMT: &str = r"[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*";

static DNS1123_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{}$", DNS1123_SUBDOMAIN_FMT)).expect("valid regex")
});

const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;

const VALID_PROTOCOLS: [&str; 2] = ["TCP", "UDP"];

/// Reasons for rejecting a [`RuleType`] or a [`Rule`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cannot have empty tsuru app name and pool name")]
    EmptyApp,
    #[error("cannot set both app name and pool name")]
    AppAndPool,
    #[error("invalid app name")]
    InvalidAppName,
    #[error("cannot have empty tsuru job name")]
    EmptyJob,
    #[error("invalid job name")]
    InvalidJobName,
    #[error("cannot have empty external dns name")]
    EmptyDns,
    #[error("DNS Rule: Name must be a valid DNS name, {0}")]
    InvalidDns(String),
    #[error("DNS Rule: Name must not be a cluster internal address")]
    ClusterInternalDns,
    #[error("cannot have empty external ip address")]
    EmptyIp,
    #[error("IP Rule: Invalid IP, {0}")]
    InvalidIp(String),
    #[error("IP Rule: Invalid IP, IPv6 is not supported yet")]
    Ipv6NotSupported,
    #[error("IP Rule: Large CIDR, the maximum size of network without ports is /22")]
    LargeCidr,
    #[error("invalid port number 0")]
    InvalidPort,
    #[error("invalid protocol {0:?}, valid values are: {valid}", valid = VALID_PROTOCOLS.join(", "))]
    InvalidProtocol(String),
    #[error("source: {0}")]
    Source(Box<ValidationError>),
    #[error("destination: {0}")]
    Destination(Box<ValidationError>),
}

/// A declarative statement that `source` may reach `destination`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Rule {
    #[serde(rename = "RuleID", default)]
    pub rule_id: String,
    /// Optional unique, human friendly alias of `rule_id`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_name: String,
    pub source: RuleType,
    pub destination: RuleType,
    /// Soft-delete flag, removed rules are still synced once so targets learn about the removal.
    #[serde(default)]
    pub removed: bool,
    /// Free-form provenance and grouping data.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub creator: String,
}

impl Rule {
    pub fn new(source: RuleType, destination: RuleType) -> Self {
        Self {
            rule_id: Default::default(),
            rule_name: Default::default(),
            source,
            destination,
            removed: false,
            metadata: Default::default(),
            created: Default::default(),
            creator: Default::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source
            .validate()
            .map_err(|e| ValidationError::Source(Box::new(e)))?;
        self.destination
            .validate()
            .map_err(|e| ValidationError::Destination(Box::new(e)))?;
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[RuleID: {}, Source: {}, Destination: {}]",
            self.rule_id, self.source, self.destination
        )
    }
}

/// Endpoint descriptor, exactly one endpoint kind per descriptor.
///
/// The JSON representation keeps the document layout of the rule store,
/// e.g. `{"TsuruApp":{"AppName":"myapp"}}`. A document with zero or more
/// than one kind does not deserialize.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleType {
    TsuruApp(TsuruAppRule),
    TsuruJob(TsuruJobRule),
    #[serde(rename = "ExternalDNS")]
    ExternalDns(ExternalDnsRule),
    #[serde(rename = "ExternalIP")]
    ExternalIp(ExternalIpRule),
}

/// A tsuru application, addressed by application name or by pool name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TsuruAppRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pool_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TsuruJobRule {
    #[serde(default)]
    pub job_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalDnsRule {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<ProtoPort>,
    #[serde(default)]
    pub sync_whole_network: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalIpRule {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(default)]
    pub ports: Vec<ProtoPort>,
    #[serde(default)]
    pub sync_whole_network: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "PascalCase")]
pub struct ProtoPort {
    pub protocol: String,
    pub port: u16,
}

impl ProtoPort {
    pub fn new(protocol: &str, port: u16) -> Self {
        Self {
            protocol: protocol.to_string(),
            port,
        }
    }
}

impl fmt::Display for ProtoPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)
    }
}

/// Compare two port lists as sets per protocol, ignoring order and protocol case.
pub fn ports_equal(a: &[ProtoPort], b: &[ProtoPort]) -> bool {
    fn by_protocol(ports: &[ProtoPort], protocol: &str) -> BTreeSet<u16> {
        ports
            .iter()
            .filter(|p| p.protocol.eq_ignore_ascii_case(protocol))
            .map(|p| p.port)
            .collect()
    }
    a.len() == b.len()
        && by_protocol(a, "tcp") == by_protocol(b, "tcp")
        && by_protocol(a, "udp") == by_protocol(b, "udp")
}

fn validate_ports(ports: &[ProtoPort]) -> Result<(), ValidationError> {
    for p in ports {
        if p.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        let protocol = p.protocol.to_uppercase();
        if !VALID_PROTOCOLS.contains(&protocol.as_str()) {
            return Err(ValidationError::InvalidProtocol(p.protocol.clone()));
        }
    }
    Ok(())
}

fn validate_tsuru_name(name: &str) -> bool {
    TSURU_NAME.is_match(name)
}

fn validate_dns1123_subdomain(name: &str) -> Result<(), String> {
    if name.len() > DNS1123_SUBDOMAIN_MAX_LENGTH {
        return Err(format!(
            "must be no more than {} characters",
            DNS1123_SUBDOMAIN_MAX_LENGTH
        ));
    }
    if !DNS1123_SUBDOMAIN.is_match(name) {
        return Err(format!(
            "a lowercase RFC 1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character (e.g. 'example.com', regex used for validation is '{}')",
            DNS1123_SUBDOMAIN_FMT
        ));
    }
    Ok(())
}

impl RuleType {
    pub fn tsuru_app(&self) -> Option<&TsuruAppRule> {
        match self {
            RuleType::TsuruApp(app) => Some(app),
            _ => None,
        }
    }

    pub fn tsuru_job(&self) -> Option<&TsuruJobRule> {
        match self {
            RuleType::TsuruJob(job) => Some(job),
            _ => None,
        }
    }

    /// Check that the populated endpoint kind is well-formed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            RuleType::TsuruApp(app) => {
                if app.app_name.is_empty() && app.pool_name.is_empty() {
                    return Err(ValidationError::EmptyApp);
                }
                if !app.app_name.is_empty() && !app.pool_name.is_empty() {
                    return Err(ValidationError::AppAndPool);
                }
                if !app.app_name.is_empty() && !validate_tsuru_name(&app.app_name) {
                    return Err(ValidationError::InvalidAppName);
                }
                Ok(())
            }
            RuleType::TsuruJob(job) => {
                if job.job_name.is_empty() {
                    return Err(ValidationError::EmptyJob);
                }
                if !validate_tsuru_name(&job.job_name) {
                    return Err(ValidationError::InvalidJobName);
                }
                Ok(())
            }
            RuleType::ExternalDns(dns) => {
                if dns.name.is_empty() {
                    return Err(ValidationError::EmptyDns);
                }
                // A leading dot selects all subdomains.
                let name = dns.name.strip_prefix('.').unwrap_or(&dns.name);
                validate_dns1123_subdomain(name).map_err(ValidationError::InvalidDns)?;
                if dns.name.ends_with("cluster.local") {
                    return Err(ValidationError::ClusterInternalDns);
                }
                validate_ports(&dns.ports)
            }
            RuleType::ExternalIp(ip) => {
                if ip.ip.is_empty() {
                    return Err(ValidationError::EmptyIp);
                }
                let mut cidr = ip.ip.clone();
                if !cidr.contains('/') {
                    if cidr.contains(':') {
                        cidr.push_str("/128");
                    } else if cidr.contains('.') {
                        cidr.push_str("/32");
                    }
                }
                let net = IpNet::from_str(&cidr)
                    .map_err(|e| ValidationError::InvalidIp(format!("invalid CIDR address: {}: {}", ip.ip, e)))?;
                match net {
                    IpNet::V6(_) => return Err(ValidationError::Ipv6NotSupported),
                    IpNet::V4(v4) => {
                        if v4.prefix_len() < 22 && ip.ports.is_empty() {
                            return Err(ValidationError::LargeCidr);
                        }
                    }
                }
                validate_ports(&ip.ports)
            }
        }
    }

    /// Endpoint equality as used to de-duplicate stored rules.
    ///
    /// A missing descriptor on either side compares equal, including when only one
    /// side is missing. A job on the left compares equal to any endpoint, jobs
    /// take no part in de-duplication.
    pub fn equals(this: Option<&RuleType>, other: Option<&RuleType>) -> bool {
        match (this, other) {
            (None, None) => true,
            (None, Some(_)) | (Some(_), None) => true,
            (Some(RuleType::TsuruJob(_)), Some(_)) => true,
            (Some(a), Some(b)) => a.same_endpoint(b),
        }
    }

    /// Compare endpoints, treating port lists as unordered sets.
    pub fn same_endpoint(&self, other: &RuleType) -> bool {
        match (self, other) {
            (RuleType::TsuruApp(a), RuleType::TsuruApp(b)) => a == b,
            (RuleType::TsuruJob(a), RuleType::TsuruJob(b)) => a == b,
            (RuleType::ExternalDns(a), RuleType::ExternalDns(b)) => {
                a.name == b.name
                    && a.sync_whole_network == b.sync_whole_network
                    && ports_equal(&a.ports, &b.ports)
            }
            (RuleType::ExternalIp(a), RuleType::ExternalIp(b)) => {
                a.ip == b.ip
                    && a.sync_whole_network == b.sync_whole_network
                    && ports_equal(&a.ports, &b.ports)
            }
            _ => false,
        }
    }

    /// Canonical serialization, stable regardless of port ordering.
    pub fn cache_key(&self) -> Result<String, serde_json::Error> {
        let mut normalized = self.clone();
        match &mut normalized {
            RuleType::ExternalDns(dns) => dns.ports.sort(),
            RuleType::ExternalIp(ip) => ip.ports.sort(),
            _ => (),
        }
        serde_json::to_string(&normalized)
    }
}

fn pretty_ports(ports: &[ProtoPort]) -> String {
    if ports.is_empty() {
        return String::new();
    }
    let mut strs: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    strs.sort();
    format!(", Ports: {}", strs.join(", "))
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::TsuruApp(app) if app.app_name.is_empty() && !app.pool_name.is_empty() => {
                write!(f, "Tsuru Pool: {}", app.pool_name)
            }
            RuleType::TsuruApp(app) => write!(f, "Tsuru APP: {}", app.app_name),
            RuleType::TsuruJob(job) => write!(f, "Tsuru Job: {}", job.job_name),
            RuleType::ExternalDns(dns) => write!(
                f,
                "DNS: {}{}{}",
                dns.name,
                pretty_ports(&dns.ports),
                if dns.sync_whole_network { ", whole network" } else { "" }
            ),
            RuleType::ExternalIp(ip) => write!(
                f,
                "IP: {}{}{}",
                ip.ip,
                pretty_ports(&ip.ports),
                if ip.sync_whole_network { ", whole network" } else { "" }
            ),
        }
    }
}

/// Lock and history record of one `(rule, engine)` pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RuleSyncInfo {
    #[serde(rename = "SyncID")]
    pub sync_id: String,
    #[serde(rename = "RuleID")]
    pub rule_id: String,
    pub engine: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Last keep-alive, a running record is stale once this is older than the lock expiry.
    pub ping_time: DateTime<Utc>,
    pub running: bool,
    /// Oldest first, capped at [`SYNC_HISTORY_LIMIT`].
    pub syncs: Vec<RuleSyncData>,
}

impl RuleSyncInfo {
    pub fn latest_sync(&self) -> Option<&RuleSyncData> {
        self.syncs.last()
    }
}

/// Outcome of a single reconciliation of a `(rule, engine)` pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct RuleSyncData {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub successful: bool,
    pub removed: bool,
    pub error: String,
    pub sync_result: String,
}
