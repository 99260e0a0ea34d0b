//! Wire protocol types.
//!
//! Newline-delimited JSON-RPC 2.0 subset. Inbound lines are classified once,
//! at parse time, into a [`Message`] variant; nothing downstream inspects raw
//! JSON fields again.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::ProtocolError;

/// JSON-RPC protocol version tag written on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method used for tool invocations.
pub const TOOLS_CALL: &str = "tools/call";

/// Method used to enumerate the child's tools.
pub const TOOLS_LIST: &str = "tools/list";

// ─── Outbound ────────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Build a `tools/call` request.
    pub fn tool_call(id: u64, name: &str, arguments: Value) -> Self {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        Self::new(id, TOOLS_CALL, Some(params))
    }
}

/// Outbound notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

/// Serialize a message as one wire line (JSON followed by a single `\n`).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

// ─── Inbound ─────────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The payload of a response: either a result or an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcError),
}

/// A server-initiated message that carries no correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// One classified line of the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request. Only produced outbound by the bridge; inbound requests
    /// from the child are classified but not served.
    Request {
        id: u64,
        method: String,
        params: Option<Value>,
    },
    /// A reply to a request the bridge sent.
    Response { id: u64, outcome: ResponseOutcome },
    /// An unsolicited event from the child.
    Notification(Notification),
}

impl Message {
    /// Classify a parsed JSON value.
    ///
    /// - `id` + (`result` | `error`) → `Response` (`error` wins if both exist)
    /// - `id` + `method` → `Request`
    /// - `method` without `id` → `Notification`
    /// - anything else → [`ProtocolError::UnknownShape`]
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::UnknownShape);
        };

        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or(ProtocolError::UnknownShape)?),
        };

        match id {
            Some(id) if obj.contains_key("error") || obj.contains_key("result") => {
                let outcome = match obj.remove("error") {
                    Some(err) if !err.is_null() => ResponseOutcome::Error(parse_rpc_error(err)),
                    _ => ResponseOutcome::Result(obj.remove("result").unwrap_or(Value::Null)),
                };
                Ok(Message::Response { id, outcome })
            }
            Some(id) => {
                let method = take_method(&mut obj).ok_or(ProtocolError::UnknownShape)?;
                Ok(Message::Request {
                    id,
                    method,
                    params: obj.remove("params"),
                })
            }
            None => {
                let method = take_method(&mut obj).ok_or(ProtocolError::UnknownShape)?;
                Ok(Message::Notification(Notification {
                    method,
                    params: obj.remove("params").unwrap_or(Value::Null),
                }))
            }
        }
    }
}

fn take_method(obj: &mut Map<String, Value>) -> Option<String> {
    match obj.remove("method") {
        Some(Value::String(method)) => Some(method),
        _ => None,
    }
}

/// Lenient error-object parsing: a bare string or an object missing
/// `message` still yields something readable.
fn parse_rpc_error(value: Value) -> RpcError {
    match value {
        Value::String(message) => RpcError {
            code: 0,
            message,
            data: None,
        },
        other => {
            let fallback = other.to_string();
            let mut err: RpcError = serde_json::from_value(other).unwrap_or(RpcError {
                code: 0,
                message: String::new(),
                data: None,
            });
            if err.message.is_empty() {
                err.message = fallback;
            }
            err
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
