//! Typed declarative policy document
//!
//! The policy source is a JSON document deserialized into the structures
//! here; full grammar handling lives with the parsing collaborator, this
//! module only fixes the shape. Field presence and valid combinations are
//! checked at morph time by [`crate::core::model`], not on access.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::error::Result;
use crate::core::fragment::Family;

/// Accepts a bare value where a list is allowed ("ssh" vs ["ssh", "dns"]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v),
            OneOrMany::Many(v) => v.as_slice(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// Transport protocol of a service definition
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "icmpv6")]
    Icmpv6,
}

/// Port or inclusive port range ("8000-8010")
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortSpec {
    Num(u16),
    Range(String),
}

/// One variant of a service: protocol plus port/type constraints
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceDef {
    pub proto: Option<Proto>,
    #[serde(default)]
    pub port: OneOrMany<PortSpec>,
    /// ICMP/ICMPv6 message type
    #[serde(rename = "type")]
    pub icmp_type: Option<u8>,
    /// Restricts the definition to one address family
    pub family: Option<Family>,
    /// Connection-tracking helper associated with matching traffic
    pub helper: Option<String>,
}

/// Named zone: the interfaces and/or addresses traffic enters or leaves by
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    #[serde(default)]
    pub iface: OneOrMany<String>,
    /// CIDR literals or names resolved through the address resolver
    #[serde(default)]
    pub addr: OneOrMany<String>,
}

/// Logging directive on a rule: plain switch or reference to a named log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LogDirective {
    Flag(bool),
    Named(String),
}

/// Log mode for a named log definition
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    #[strum(serialize = "log")]
    Log,
    #[strum(serialize = "nflog")]
    Nflog,
}

/// Named log definition
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogSpec {
    #[serde(default)]
    pub mode: LogMode,
    pub prefix: Option<String>,
    /// Log matches per second; `None` logs unconditionally
    pub limit: Option<u32>,
}

/// Which end of the connection a limit counts by
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum AddrSelector {
    #[default]
    #[strum(serialize = "src")]
    Src,
    #[strum(serialize = "dest")]
    Dest,
}

/// Per-family prefix lengths the limit tracker masks addresses with
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaskSpec {
    #[serde(default = "default_inet_mask")]
    pub inet: u8,
    #[serde(default = "default_inet6_mask")]
    pub inet6: u8,
}

impl Default for MaskSpec {
    fn default() -> Self {
        Self {
            inet: default_inet_mask(),
            inet6: default_inet6_mask(),
        }
    }
}

fn default_inet_mask() -> u8 {
    32
}

fn default_inet6_mask() -> u8 {
    128
}

fn default_interval() -> u32 {
    1
}

/// Full limit specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitSpec {
    pub count: u32,
    /// Measurement interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Symbolic tracker name; rules sharing a name share a counter when
    /// `update` is set
    pub name: Option<String>,
    #[serde(default)]
    pub addr: AddrSelector,
    #[serde(default)]
    pub mask: MaskSpec,
    pub log: Option<LogDirective>,
    #[serde(default)]
    pub update: bool,
}

/// Limit directive on a rule: bare count or full specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LimitDirective {
    Count(u32),
    Full(LimitSpec),
}

impl LimitDirective {
    pub fn spec(&self) -> LimitSpec {
        match self {
            LimitDirective::Count(count) => LimitSpec {
                count: *count,
                interval: default_interval(),
                name: None,
                addr: AddrSelector::default(),
                mask: MaskSpec::default(),
                log: None,
                update: false,
            },
            LimitDirective::Full(spec) => spec.clone(),
        }
    }
}

/// Destination-NAT directive: bare address or address plus port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DnatSpec {
    Addr(String),
    Full { addr: String, port: Option<u16> },
}

impl DnatSpec {
    pub fn addr(&self) -> &str {
        match self {
            DnatSpec::Addr(a) => a,
            DnatSpec::Full { addr, .. } => addr,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            DnatSpec::Addr(_) => None,
            DnatSpec::Full { port, .. } => *port,
        }
    }
}

/// Address-set match on a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpsetMatch {
    pub name: String,
    /// Match flags, e.g. ["src"] or ["src", "dst"]
    #[serde(default)]
    pub args: Vec<String>,
}

/// One declarative filter statement
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterSpec {
    /// Source zone; absent means the firewall host itself
    #[serde(rename = "in")]
    pub src: Option<String>,
    /// Destination zone; absent means the firewall host itself
    pub out: Option<String>,
    #[serde(default)]
    pub service: OneOrMany<String>,
    pub action: Option<String>,
    pub log: Option<LogDirective>,
    pub dnat: Option<DnatSpec>,
    #[serde(default, rename = "no-track")]
    pub no_track: bool,
    #[serde(rename = "conn-limit")]
    pub conn_limit: Option<LimitDirective>,
    #[serde(rename = "flow-limit")]
    pub flow_limit: Option<LimitDirective>,
    /// Services whose helper flows are admitted alongside this rule
    pub related: Option<Vec<String>>,
    pub ipset: Option<IpsetMatch>,
}

/// Default-posture statement: a filter without the service dimension
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicySpec {
    #[serde(rename = "in")]
    pub src: Option<String>,
    pub out: Option<String>,
    pub action: Option<String>,
    pub log: Option<LogDirective>,
}

/// Raw rule inside a user-defined custom chain
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CustomRule {
    #[serde(rename = "match")]
    pub match_text: Option<String>,
    pub target: Option<String>,
    pub family: Option<Family>,
}

/// Address-set definition, passed through to the compiled artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpsetSpec {
    #[serde(rename = "type")]
    pub set_type: String,
    pub family: Option<Family>,
}

/// Service definitions: one variant or a list of variants
pub type ServiceValue = OneOrMany<ServiceDef>;

/// The whole declarative policy document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    #[serde(default)]
    pub zone: BTreeMap<String, Zone>,
    #[serde(default)]
    pub service: BTreeMap<String, ServiceValue>,
    #[serde(default)]
    pub filter: Vec<FilterSpec>,
    #[serde(default)]
    pub policy: Vec<PolicySpec>,
    #[serde(default)]
    pub custom: BTreeMap<String, Vec<CustomRule>>,
    #[serde(default)]
    pub ipset: BTreeMap<String, IpsetSpec>,
    #[serde(default)]
    pub log: BTreeMap<String, LogSpec>,
}

impl Policy {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Family of an address literal or resolved network
pub fn family_of(net: &IpNetwork) -> Family {
    if net.is_ipv4() {
        Family::Inet
    } else {
        Family::Inet6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document() {
        let policy = Policy::from_json(r#"{ "filter": [ { "action": "drop" } ] }"#).unwrap();
        assert_eq!(policy.filter.len(), 1);
        assert_eq!(policy.filter[0].action.as_deref(), Some("drop"));
        assert!(policy.filter[0].src.is_none());
    }

    #[test]
    fn test_service_single_or_list() {
        let policy = Policy::from_json(
            r#"{
                "service": {
                    "ssh": { "proto": "tcp", "port": 22 },
                    "dns": [
                        { "proto": "udp", "port": 53 },
                        { "proto": "tcp", "port": 53 }
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(policy.service["ssh"].as_slice().len(), 1);
        assert_eq!(policy.service["dns"].as_slice().len(), 2);
        assert_eq!(policy.service["ssh"].as_slice()[0].proto, Some(Proto::Tcp));
    }

    #[test]
    fn test_limit_directive_forms() {
        let bare = LimitDirective::Count(10).spec();
        assert_eq!(bare.count, 10);
        assert_eq!(bare.interval, 1);
        assert_eq!(bare.addr, AddrSelector::Src);

        let full: LimitDirective = serde_json::from_str(
            r#"{ "count": 3, "interval": 60, "addr": "dest", "update": true }"#,
        )
        .unwrap();
        let spec = full.spec();
        assert_eq!(spec.count, 3);
        assert_eq!(spec.interval, 60);
        assert_eq!(spec.addr, AddrSelector::Dest);
        assert!(spec.update);
        assert_eq!(spec.mask.inet, 32);
        assert_eq!(spec.mask.inet6, 128);
    }

    #[test]
    fn test_dnat_forms() {
        let bare: DnatSpec = serde_json::from_str(r#""10.0.0.5""#).unwrap();
        assert_eq!(bare.addr(), "10.0.0.5");
        assert_eq!(bare.port(), None);

        let full: DnatSpec =
            serde_json::from_str(r#"{ "addr": "10.0.0.5", "port": 8080 }"#).unwrap();
        assert_eq!(full.addr(), "10.0.0.5");
        assert_eq!(full.port(), Some(8080));
    }

    #[test]
    fn test_log_directive_forms() {
        let flag: LogDirective = serde_json::from_str("false").unwrap();
        assert_eq!(flag, LogDirective::Flag(false));
        let named: LogDirective = serde_json::from_str(r#""audit""#).unwrap();
        assert_eq!(named, LogDirective::Named("audit".into()));
    }
}
