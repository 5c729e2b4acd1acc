//! JSON-RPC 2.0 message types shared by the parent and child sides of the
//! proxy.
//!
//! Tool catalogs, schemas and forwarded payloads stay as `serde_json::Value`
//! so that fields the proxy does not understand survive the round trip.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version advertised when neither a child nor the parent supplies
/// one.
pub const FALLBACK_PROTOCOL_VERSION: &str = "2024-06-13";

/// Name forced into `serverInfo.name` on every initialize reply.
pub const SERVER_NAME: &str = "mcp";

/// JSON-RPC request ID (string or number)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 notification (no id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: msg.into(),
            data: None,
        }
    }
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A decoded message from either peer, classified by shape: an `id` plus
/// `method` is a request, an `id` alone is a response, a `method` alone is a
/// notification.
#[derive(Debug, Clone)]
pub enum McpMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl McpMessage {
    pub fn from_json(value: Value) -> anyhow::Result<Self> {
        let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
        if has_id {
            if value.get("method").is_some() {
                Ok(McpMessage::Request(serde_json::from_value(value)?))
            } else {
                Ok(McpMessage::Response(serde_json::from_value(value)?))
            }
        } else {
            Ok(McpMessage::Notification(serde_json::from_value(value)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_request() {
        let msg = McpMessage::from_json(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        }))
        .unwrap();
        assert!(matches!(msg, McpMessage::Request(_)));
    }

    #[test]
    fn classifies_response() {
        let msg = McpMessage::from_json(json!({
            "jsonrpc": "2.0", "id": "abc", "result": {"ok": true}
        }))
        .unwrap();
        match msg {
            McpMessage::Response(r) => assert_eq!(r.id, RequestId::from("abc")),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn classifies_notification() {
        let msg = McpMessage::from_json(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(matches!(msg, McpMessage::Notification(_)));
    }

    #[test]
    fn null_id_is_a_notification() {
        let msg = McpMessage::from_json(json!({
            "jsonrpc": "2.0", "id": null, "method": "ping"
        }))
        .unwrap();
        assert!(matches!(msg, McpMessage::Notification(_)));
    }

    #[test]
    fn string_and_number_ids_are_distinct() {
        assert_ne!(RequestId::from("1"), RequestId::from(1));
    }

    #[test]
    fn notification_serializes_without_id() {
        let n = JsonRpcNotification::new("notifications/progress", Some(json!({"p": 1})));
        let v = serde_json::to_value(&n).unwrap();
        assert!(v.get("id").is_none());
        assert_eq!(v["method"], "notifications/progress");
    }
}
