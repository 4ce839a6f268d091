use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::ClusterError;

/// Fields returned by the `partial` projection.
pub const PARTIAL_FIELDS: [&str; 6] = ["id", "host", "port", "kind", "status", "route"];

pub const DEFAULT_KIND: &str = "neighbour";

/// Generates a fresh dossier id.
pub fn new_dossier_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Per-peer membership state driving the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum MembershipStatus {
    /// Newly known, never contacted.
    Unknown,
    /// Handshake sent, awaiting ACK.
    Registration,
    /// Last contact succeeded.
    Active,
    /// Last heartbeat failed with a generic error or timeout.
    Down,
    /// Last heartbeat was refused by the peer.
    ConnectionRefused,
    /// Administratively excluded. No outbound action is ever issued.
    Disabled,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Unknown => "unknown",
            MembershipStatus::Registration => "registration",
            MembershipStatus::Active => "active",
            MembershipStatus::Down => "down",
            MembershipStatus::ConnectionRefused => "connection_refused",
            MembershipStatus::Disabled => "disabled",
        }
    }

    /// Whether the scheduler should run the handshake for this peer.
    pub fn needs_registration(&self) -> bool {
        matches!(
            self,
            MembershipStatus::Unknown | MembershipStatus::Registration
        )
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`NodeStore::advance_status`](super::NodeStore::advance_status) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Applied { previous: MembershipStatus },
    KeptDisabled,
    Missing,
}

impl FromStr for MembershipStatus {
    type Err = ClusterError;

    /// Accepts the canonical names plus the spellings found in older node
    /// documents. Anything else is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(MembershipStatus::Unknown),
            "registration" | "Registration" => Ok(MembershipStatus::Registration),
            "active" => Ok(MembershipStatus::Active),
            "down" => Ok(MembershipStatus::Down),
            "connection_refused" | "Connection refused" => {
                Ok(MembershipStatus::ConnectionRefused)
            }
            "disabled" | "disable" => Ok(MembershipStatus::Disabled),
            other => Err(ClusterError::validation(format!(
                "unrecognized membership status '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for MembershipStatus {
    type Error = ClusterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for MembershipStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One descriptor record, either the node's own (`self`) or a peer's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dossier {
    pub id: String,
    pub host: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    #[serde(alias = "type", default = "default_kind")]
    pub kind: String,
    #[serde(alias = "active")]
    pub status: MembershipStatus,
    #[serde(default)]
    pub route: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,

    /// Fields this version does not model, kept so rewrites lose nothing.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Dossier {
    /// A bare peer entry as created by an administrator.
    pub fn new_peer(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: new_dossier_id(),
            host: host.into(),
            port,
            kind: DEFAULT_KIND.to_string(),
            status: MembershipStatus::Unknown,
            route: String::new(),
            hostname: None,
            memory: None,
            cpu: None,
            services: None,
            extra: Map::new(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn same_address(&self, other: &Dossier) -> bool {
        self.host == other.host && self.port == other.port
    }

    /// Projects the record according to `format`.
    pub fn project(&self, format: &FormatSpec) -> Result<Value, ClusterError> {
        let full = serde_json::to_value(self)
            .map_err(|e| ClusterError::Internal(format!("serialize dossier: {}", e)))?;
        let Value::Object(map) = full else {
            return Err(ClusterError::Internal("dossier is not an object".into()));
        };

        let keep: Vec<&str> = match format {
            FormatSpec::Full => return Ok(Value::Object(map)),
            FormatSpec::Partial => PARTIAL_FIELDS.to_vec(),
            FormatSpec::Fields(fields) => fields.iter().map(String::as_str).collect(),
        };

        let projected = map
            .into_iter()
            .filter(|(key, _)| keep.contains(&key.as_str()))
            .collect();
        Ok(Value::Object(projected))
    }
}

fn default_kind() -> String {
    DEFAULT_KIND.to_string()
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    parse_port(&raw).map_err(serde::de::Error::custom)
}

/// Reads a port from a JSON number or a numeric string.
pub fn parse_port(raw: &Value) -> Result<u16, String> {
    let number = match raw {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| format!("port must be a non-negative integer, got {}", n))?,
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("port must be numeric, got '{}'", s))?,
        other => return Err(format!("port must be a number, got {}", other)),
    };
    u16::try_from(number).map_err(|_| format!("port {} out of range 0-65535", number))
}

/// The two descriptor collections addressable through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    SelfNode,
    Nodes,
}

impl Group {
    pub fn as_str(&self) -> &'static str {
        match self {
            Group::SelfNode => "self",
            Group::Nodes => "nodes",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Group {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "self" => Ok(Group::SelfNode),
            "nodes" => Ok(Group::Nodes),
            other => Err(ClusterError::validation(format!("unknown group '{}'", other))),
        }
    }
}

/// Projection applied by `load_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSpec {
    Full,
    Partial,
    Fields(Vec<String>),
}

impl FormatSpec {
    /// Parses the wire form: `"full"`, `"partial"` or a list of field names.
    pub fn from_value(raw: &Value) -> Result<Self, ClusterError> {
        match raw {
            Value::String(s) => match s.trim() {
                "" => Err(ClusterError::validation("format must not be empty")),
                "full" => Ok(FormatSpec::Full),
                "partial" => Ok(FormatSpec::Partial),
                other => Err(ClusterError::validation(format!(
                    "unknown format '{}'",
                    other
                ))),
            },
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(ClusterError::validation("field list must not be empty"));
                }
                let mut fields = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str().map(str::trim) {
                        Some(name) if !name.is_empty() => fields.push(name.to_string()),
                        _ => {
                            return Err(ClusterError::validation(
                                "field list must contain non-empty strings",
                            ));
                        }
                    }
                }
                Ok(FormatSpec::Fields(fields))
            }
            _ => Err(ClusterError::validation(
                "format must be a string or a list of field names",
            )),
        }
    }
}

/// The on-disk unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStoreDocument {
    #[serde(rename = "self", default)]
    pub self_node: Vec<Dossier>,
    #[serde(default)]
    pub nodes: Vec<Dossier>,
    /// Reserved; carried untouched.
    #[serde(default)]
    pub cluster: Vec<Value>,
}

impl NodeStoreDocument {
    pub fn with_self(self_node: Dossier) -> Self {
        Self {
            self_node: vec![self_node],
            nodes: Vec::new(),
            cluster: Vec::new(),
        }
    }

    pub fn group(&self, group: Group) -> &Vec<Dossier> {
        match group {
            Group::SelfNode => &self.self_node,
            Group::Nodes => &self.nodes,
        }
    }

    pub fn group_mut(&mut self, group: Group) -> &mut Vec<Dossier> {
        match group {
            Group::SelfNode => &mut self.self_node,
            Group::Nodes => &mut self.nodes,
        }
    }

    /// Checks the document invariants after loading.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.self_node.len() != 1 {
            return Err(ClusterError::Storage(format!(
                "'self' must hold exactly one entry, found {}",
                self.self_node.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ClusterError::Storage(format!(
                    "duplicate id '{}' in 'nodes'",
                    node.id
                )));
            }
        }
        Ok(())
    }
}
