//! RPC Wire Protocol
//!
//! Requests are JSON objects POSTed to [`ENDPOINT_RPC`]:
//! `{ "method": "addDossier", "params": { "key": "...", "group": "nodes", "fields": {...} } }`.
//!
//! Every reply, success or failure, is an [`Envelope`]:
//! `{ "answer": [{ "retcode", "desc", "time", "event_id" }], "data": ... }`.
//!
//! Parsing into [`RpcCall`] checks parameters in a fixed order: missing or
//! empty values first, then value shapes. Authorization happens afterwards in
//! the service, so a malformed call never reaches the store.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{ClusterError, Result};
use crate::store::types::{Dossier, FormatSpec, Group, MembershipStatus, parse_port};

/// Single endpoint serving every method.
pub const ENDPOINT_RPC: &str = "/RPC2";

/// Reply body of a successful `ping`.
pub const PONG: &str = "Pong";

pub const RETCODE_OK: u8 = 0;

// --- Requests ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl RpcRequest {
    pub fn new(method: RpcMethod, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            method: method.as_str().to_string(),
            params,
        }
    }
}

/// The closed set of remotely callable methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Ping,
    Register,
    GetDossier,
    AddDossier,
    UpdateDossier,
    DeleteDossier,
}

impl RpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::Ping => "ping",
            RpcMethod::Register => "register",
            RpcMethod::GetDossier => "getDossier",
            RpcMethod::AddDossier => "addDossier",
            RpcMethod::UpdateDossier => "updateDossier",
            RpcMethod::DeleteDossier => "deleteDossier",
        }
    }

    fn required_params(&self) -> &'static [&'static str] {
        match self {
            RpcMethod::Ping => &[],
            RpcMethod::Register => &["REG"],
            RpcMethod::GetDossier => &["group", "format"],
            RpcMethod::AddDossier => &["group", "fields"],
            RpcMethod::UpdateDossier => &["group", "id", "fields"],
            RpcMethod::DeleteDossier => &["group", "id"],
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcMethod {
    type Err = ClusterError;

    /// Also accepts the method names used by older deployments.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ping" => Ok(RpcMethod::Ping),
            "register" | "remote_registration" => Ok(RpcMethod::Register),
            "getDossier" | "get_dossier" => Ok(RpcMethod::GetDossier),
            "addDossier" | "add_dossier" => Ok(RpcMethod::AddDossier),
            "updateDossier" | "upd_dossier" => Ok(RpcMethod::UpdateDossier),
            "deleteDossier" | "del_dossier" => Ok(RpcMethod::DeleteDossier),
            other => Err(ClusterError::validation(format!("unknown method '{}'", other))),
        }
    }
}

/// Fields accepted by `addDossier`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewDossier {
    pub host: String,
    #[serde(deserialize_with = "port_field")]
    pub port: u16,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
}

/// Fields accepted by `updateDossier`. `id` is immutable and therefore absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DossierPatch {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, deserialize_with = "optional_port_field")]
    pub port: Option<u16>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Administrators may only disable a peer or send it back to `unknown`.
    #[serde(default)]
    pub status: Option<MembershipStatus>,
}

impl DossierPatch {
    pub fn is_empty(&self) -> bool {
        *self == DossierPatch::default()
    }

    /// Checks values that need more than a type check.
    pub fn validate(&self) -> Result<()> {
        if let Some(host) = &self.host {
            validate_ipv4(host)?;
        }
        if let Some(status) = self.status
            && !matches!(status, MembershipStatus::Disabled | MembershipStatus::Unknown)
        {
            return Err(ClusterError::validation(format!(
                "status can only be set to 'disabled' or 'unknown', got '{}'",
                status
            )));
        }
        Ok(())
    }

    pub fn apply(&self, record: &mut Dossier) {
        if let Some(host) = &self.host {
            record.host = host.clone();
        }
        if let Some(port) = self.port {
            record.port = port;
        }
        if let Some(kind) = &self.kind {
            record.kind = kind.clone();
        }
        if let Some(route) = &self.route {
            record.route = route.clone();
        }
        if let Some(hostname) = &self.hostname {
            record.hostname = Some(hostname.clone());
        }
        if let Some(status) = self.status {
            record.status = status;
        }
    }
}

fn port_field<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    parse_port(&raw).map_err(serde::de::Error::custom)
}

fn optional_port_field<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u16>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        raw => parse_port(&raw).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Accepts dotted-quad IPv4 only.
pub fn validate_ipv4(host: &str) -> Result<()> {
    host.parse::<std::net::Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| ClusterError::validation(format!("Invalid IP address - {}", host)))
}

/// A parsed, shape-checked call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    Ping,
    Register {
        descriptor: Dossier,
    },
    GetDossier {
        key: String,
        group: Group,
        format: FormatSpec,
        id: Option<String>,
    },
    AddDossier {
        key: String,
        group: Group,
        fields: NewDossier,
    },
    UpdateDossier {
        key: String,
        group: Group,
        id: String,
        patch: DossierPatch,
    },
    DeleteDossier {
        key: String,
        group: Group,
        id: String,
    },
}

impl RpcCall {
    pub fn method(&self) -> RpcMethod {
        match self {
            RpcCall::Ping => RpcMethod::Ping,
            RpcCall::Register { .. } => RpcMethod::Register,
            RpcCall::GetDossier { .. } => RpcMethod::GetDossier,
            RpcCall::AddDossier { .. } => RpcMethod::AddDossier,
            RpcCall::UpdateDossier { .. } => RpcMethod::UpdateDossier,
            RpcCall::DeleteDossier { .. } => RpcMethod::DeleteDossier,
        }
    }

    /// Shared secret supplied by the caller, for the methods that need one.
    pub fn auth_key(&self) -> Option<&str> {
        match self {
            RpcCall::Ping | RpcCall::Register { .. } => None,
            RpcCall::GetDossier { key, .. }
            | RpcCall::AddDossier { key, .. }
            | RpcCall::UpdateDossier { key, .. }
            | RpcCall::DeleteDossier { key, .. } => Some(key),
        }
    }

    pub fn parse(request: &RpcRequest) -> Result<Self> {
        let method: RpcMethod = request.method.parse()?;
        let params = &request.params;

        for name in method.required_params() {
            require_present(params, name)?;
        }
        if method == RpcMethod::UpdateDossier && field_object(params, "fields")?.is_empty() {
            return Err(ClusterError::validation("no fields to update"));
        }

        let call = match method {
            RpcMethod::Ping => RpcCall::Ping,
            RpcMethod::Register => RpcCall::Register {
                descriptor: from_param(params, "REG")?,
            },
            RpcMethod::GetDossier => RpcCall::GetDossier {
                key: key_param(params)?,
                group: group_param(params)?,
                format: FormatSpec::from_value(&params["format"])?,
                id: optional_str_param(params, "id")?,
            },
            RpcMethod::AddDossier => RpcCall::AddDossier {
                key: key_param(params)?,
                group: group_param(params)?,
                fields: from_param(params, "fields")?,
            },
            RpcMethod::UpdateDossier => RpcCall::UpdateDossier {
                key: key_param(params)?,
                group: group_param(params)?,
                id: str_param(params, "id")?,
                patch: from_param(params, "fields")?,
            },
            RpcMethod::DeleteDossier => RpcCall::DeleteDossier {
                key: key_param(params)?,
                group: group_param(params)?,
                id: str_param(params, "id")?,
            },
        };
        call.check_values()?;
        Ok(call)
    }

    /// Group and id the call operates on, for logging.
    pub fn target(&self) -> (Option<Group>, Option<&str>) {
        match self {
            RpcCall::Ping => (None, None),
            RpcCall::Register { descriptor } => (Some(Group::Nodes), Some(descriptor.id.as_str())),
            RpcCall::GetDossier { group, id, .. } => (Some(*group), id.as_deref()),
            RpcCall::AddDossier { group, .. } => (Some(*group), None),
            RpcCall::UpdateDossier { group, id, .. } | RpcCall::DeleteDossier { group, id, .. } => {
                (Some(*group), Some(id.as_str()))
            }
        }
    }

    /// Value rules that need no store access. Runs before authorization.
    fn check_values(&self) -> Result<()> {
        match self {
            RpcCall::Register { descriptor } => {
                if descriptor.id.trim().is_empty() {
                    return Err(ClusterError::validation("registration descriptor has no id"));
                }
                validate_ipv4(&descriptor.host)
            }
            RpcCall::AddDossier { group, fields, .. } => {
                if *group != Group::Nodes {
                    return Err(ClusterError::validation(format!(
                        "records cannot be added to '{}'",
                        group
                    )));
                }
                validate_ipv4(&fields.host)
            }
            RpcCall::UpdateDossier { group, patch, .. } => {
                if patch.is_empty() {
                    return Err(ClusterError::validation("no fields to update"));
                }
                patch.validate()?;
                if *group == Group::SelfNode && patch.status.is_some() {
                    return Err(ClusterError::validation(
                        "status of 'self' is not administrable",
                    ));
                }
                Ok(())
            }
            RpcCall::Ping | RpcCall::GetDossier { .. } | RpcCall::DeleteDossier { .. } => Ok(()),
        }
    }
}

fn require_present(params: &Map<String, Value>, name: &str) -> Result<()> {
    let empty = match params.get(name) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    };
    if empty {
        return Err(ClusterError::validation(format!(
            "Empty input argument detected: '{}'",
            name
        )));
    }
    Ok(())
}

fn field_object<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a Map<String, Value>> {
    params
        .get(name)
        .and_then(Value::as_object)
        .ok_or_else(|| ClusterError::validation(format!("'{}' must be an object", name)))
}

fn str_param(params: &Map<String, Value>, name: &str) -> Result<String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ClusterError::validation(format!("'{}' must be a string", name)))
}

fn optional_str_param(params: &Map<String, Value>, name: &str) -> Result<Option<String>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(_) => str_param(params, name).map(Some),
    }
}

/// A missing key is left empty so authorization rejects it.
fn key_param(params: &Map<String, Value>) -> Result<String> {
    match params.get("key") {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ClusterError::validation("'key' must be a string")),
    }
}

fn group_param(params: &Map<String, Value>) -> Result<Group> {
    str_param(params, "group")?.parse()
}

fn from_param<T: serde::de::DeserializeOwned>(
    params: &Map<String, Value>,
    name: &str,
) -> Result<T> {
    let raw = params.get(name).cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw)
        .map_err(|e| ClusterError::validation(format!("invalid '{}': {}", name, e)))
}

// --- Responses ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub retcode: u8,
    pub desc: String,
    pub time: String,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub answer: Vec<Answer>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event_id: &str, retcode: u8, desc: impl Into<String>, data: Value) -> Self {
        Self {
            answer: vec![Answer {
                retcode,
                desc: desc.into(),
                time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                event_id: event_id.to_string(),
            }],
            data,
        }
    }

    pub fn ok(event_id: &str, data: Value) -> Self {
        Self::new(event_id, RETCODE_OK, "Ok", data)
    }

    pub fn from_error(event_id: &str, error: &ClusterError) -> Self {
        Self::new(event_id, error.retcode(), error.public_description(), Value::Null)
    }

    pub fn retcode(&self) -> Option<u8> {
        self.answer.first().map(|a| a.retcode)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.answer.first().map(|a| a.event_id.as_str())
    }

    pub fn is_ok(&self) -> bool {
        self.retcode() == Some(RETCODE_OK)
    }
}
