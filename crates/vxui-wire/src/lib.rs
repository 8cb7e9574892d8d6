//! Wire protocol shared between a vxui backend and its display clients.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for other language clients without pulling in the runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One multiplexed request travelling client -> backend.
///
/// `parameters` mirrors `body`; the backend historically read one or the
/// other depending on the verb, so both are populated on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcEnvelope {
    #[serde(rename = "rpcID")]
    pub rpc_id: u64,
    pub verb: String,
    pub path: String,
    pub body: Value,
    pub parameters: Value,
    pub headers: HashMap<String, String>,
    /// Tag name of the originating element, never a live reference.
    pub elt: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Backend reply to an [`RpcEnvelope`]. `data` is opaque to the transport,
/// typically a markup fragment handed to the render layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    #[serde(rename = "rpcID")]
    pub rpc_id: u64,
    #[serde(default)]
    pub data: String,
}

/// Commands travelling client -> backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    Auth {
        token: String,
    },
    Ping {
        client_id: Option<String>,
        timestamp: i64,
    },
    Pong {
        client_id: Option<String>,
        timestamp: i64,
    },
    JsResult {
        js_id: u64,
        result: String,
        error: Option<String>,
    },
}

/// Commands travelling backend -> client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ServerCommand {
    AuthOk {
        client_id: String,
        /// Sandbox policy override, carried as an embedded JSON string.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        js_sandbox: Option<String>,
    },
    RunJs {
        js_id: u64,
        script: String,
    },
    Ping {
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Pong {
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Bare `"pong"` text frame, sent by some backends outside JSON framing.
    Liveness,
    Command(ServerCommand),
    Response(RpcResponse),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("unparseable frame: {0}")]
    Malformed(String),
    #[error("unrecognized command: {0}")]
    UnknownCommand(String),
    #[error("frame carries neither cmd nor rpcID")]
    Unclassified,
}

/// Classify one inbound text frame. Bare `"pong"` liveness frames are
/// recognized before any JSON parsing is attempted.
pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    if text == "pong" {
        return Ok(InboundFrame::Liveness);
    }
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
    if let Some(cmd) = value.get("cmd") {
        let name = cmd.as_str().unwrap_or_default().to_string();
        let command = serde_json::from_value::<ServerCommand>(value)
            .map_err(|_| FrameError::UnknownCommand(name))?;
        return Ok(InboundFrame::Command(command));
    }
    if value.get("rpcID").is_some() {
        let response = serde_json::from_value::<RpcResponse>(value)
            .map_err(|err| FrameError::Malformed(err.to_string()))?;
        return Ok(InboundFrame::Response(response));
    }
    Err(FrameError::Unclassified)
}

/// Rules governing whether and how a backend-supplied script may run.
///
/// The deny list is a best-effort textual filter, not an isolation
/// boundary; real containment belongs to the host script engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_result_size")]
    pub max_result_size: usize,
    #[serde(default)]
    pub allow_eval: bool,
    #[serde(default = "default_allowed_apis")]
    pub allowed_apis: Vec<String>,
    #[serde(default = "default_forbidden_patterns")]
    pub forbidden_patterns: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_result_size() -> usize {
    1_048_576
}

fn default_allowed_apis() -> Vec<String> {
    [
        "document.*",
        "window.location.*",
        "console.*",
        "localStorage.*",
        "sessionStorage.*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_forbidden_patterns() -> Vec<String> {
    [
        "eval(",
        "Function(",
        "setTimeout(",
        "setInterval(",
        "XMLHttpRequest",
        "fetch(",
        "WebSocket",
        "import(",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            timeout_ms: default_timeout_ms(),
            max_result_size: default_max_result_size(),
            allow_eval: false,
            allowed_apis: default_allowed_apis(),
            forbidden_patterns: default_forbidden_patterns(),
        }
    }
}

impl SandboxPolicy {
    /// Parse the policy override carried by `auth_ok.js_sandbox`. Missing
    /// fields fall back to the defaults; the override replaces the active
    /// policy wholesale.
    pub fn from_override(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Fold captured form pairs into a JSON object, collapsing repeated keys
/// into arrays the way multi-valued form fields serialize.
pub fn body_from_pairs<K, V>(pairs: &[(K, V)]) -> Value
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut object = Map::new();
    for (key, value) in pairs {
        let value = Value::String(value.as_ref().to_string());
        match object.get_mut(key.as_ref()) {
            None => {
                object.insert(key.as_ref().to_string(), value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
    Value::Object(object)
}
