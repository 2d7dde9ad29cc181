//! Wire types mirrored from the Incus REST API.
//!
//! Only the fields the control loops consume are modeled; unknown fields
//! are ignored on deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Error;

/// A container instance as returned by the instance listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
}

/// An instance with runtime state attached (`recursion=2` listing).
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceFull {
    pub name: String,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub state: Option<InstanceState>,
}

/// Runtime state of an instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Source an instance is created from.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl InstanceSource {
    /// A local image alias.
    pub fn image(alias: &str) -> Self {
        Self {
            source_type: "image".to_string(),
            alias: alias.to_string(),
            ..Self::default()
        }
    }

    /// An image pulled from a remote simplestreams server.
    pub fn pull(alias: &str, server: &str) -> Self {
        Self {
            source_type: "image".to_string(),
            alias: alias.to_string(),
            mode: "pull".to_string(),
            server: server.to_string(),
            protocol: "simplestreams".to_string(),
        }
    }
}

/// Instance creation request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstancesPost {
    pub name: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub source: InstanceSource,
    pub start: bool,
    pub ephemeral: bool,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

/// Command execution request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecPost {
    pub command: Vec<String>,
    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,
    pub interactive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
}

/// Instance state change request.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatePut {
    pub action: String,
    pub force: bool,
    pub timeout: i64,
}

/// Arguments for writing a file into an instance.
#[derive(Debug, Clone)]
pub struct FileArgs {
    pub mode: u32,
    pub uid: i64,
    pub gid: i64,
    /// `overwrite` or `append`.
    pub write_mode: String,
}

/// A host event. `metadata` is an untyped map whose shape depends on the
/// event type; consumers must treat it defensively.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A background operation on the host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Operation {
    /// Extract the process exit code from a completed exec operation.
    ///
    /// The host encodes it as a JSON number; the value is truncated to an
    /// integer. A missing or mistyped field is a protocol error, never
    /// success.
    pub fn exit_code(&self) -> Result<i64, Error> {
        self.metadata
            .get("return")
            .and_then(serde_json::Value::as_f64)
            .map(|code| code as i64)
            .ok_or_else(|| Error::Protocol("exec operation metadata has no return code".into()))
    }

    /// Extract the image fingerprint from a completed publish operation.
    pub fn fingerprint(&self) -> Result<String, Error> {
        self.metadata
            .get("fingerprint")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("publish operation metadata has no fingerprint".into()))
    }

    /// Extract the publish progress percentage, if present.
    pub fn progress_percent(&self) -> Option<u8> {
        let percent = self.metadata.get("progress")?.get("percent")?;
        match percent {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().map(|v| v.min(100) as u8),
            _ => None,
        }
    }
}

/// Image publish request.
#[derive(Debug, Clone, Serialize)]
pub struct ImagesPost {
    pub source: ImageSource,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Source of a published image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSource {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
}

/// Image alias creation request.
#[derive(Debug, Clone, Serialize)]
pub struct ImageAliasesPost {
    pub name: String,
    pub target: String,
    #[serde(rename = "type")]
    pub alias_type: String,
}

/// An existing image alias.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageAliasesEntry {
    pub name: String,
    #[serde(default)]
    pub target: String,
}
