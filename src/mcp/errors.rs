//! Child failure normalization.
//!
//! Children fail in wildly different shapes: JSON-RPC error objects, spawn
//! failures, transport write errors. Everything surfaced to the parent goes
//! through [`normalize_error`], which produces one envelope:
//!
//! ```text
//! { code, message, data: { kind, retryable, original, toolName?, serverName? } }
//! ```
//!
//! `data.original` carries the untouched input for downstream debugging.

use super::types::JsonRpcError;
use serde_json::{json, Value};

/// Error taxonomy carried in `data.kind`.
pub const KIND_SPAWN_ERROR: &str = "spawn_error";
pub const KIND_SERVER_ERROR: &str = "server_error";
pub const KIND_TOOL_ERROR: &str = "tool_error";

const SPAWN_ENOENT_MESSAGE: &str =
    "Spawn error (ENOENT): command not found. Check PATH or use 'npx tsx <path-to-index.ts>'.";
const DEGENERATE_MESSAGE: &str = "[object Object]";

/// Where the error came from, for contextual message shaping.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub method: Option<String>,
    pub tool_name: Option<String>,
    pub server_name: Option<String>,
}

impl ErrorContext {
    pub fn for_tool(tool_name: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            method: Some("tools/call".to_string()),
            tool_name: Some(tool_name.into()),
            server_name: Some(server_name.into()),
        }
    }
}

/// Build a raw spawn-failure error value from an I/O error, preserving the
/// string `code` convention (`"ENOENT"` for a missing executable).
pub fn spawn_failure(err: &std::io::Error, command: &str) -> Value {
    let code = match err.kind() {
        std::io::ErrorKind::NotFound => "ENOENT",
        std::io::ErrorKind::PermissionDenied => "EACCES",
        _ => "ESPAWN",
    };
    json!({
        "code": code,
        "message": format!("failed to spawn '{}': {}", command, err),
    })
}

/// Normalize a heterogeneous child failure into the single proxy envelope.
///
/// With `passthrough` set the raw error is returned as-is (best effort: a
/// value that is not a JSON-RPC error object is wrapped minimally).
pub fn normalize_error(original: &Value, ctx: &ErrorContext, passthrough: bool) -> JsonRpcError {
    if passthrough {
        return passthrough_error(original);
    }

    let numeric_code = original.get("code").and_then(Value::as_i64);
    let string_code = original.get("code").and_then(Value::as_str);
    let original_message = original.get("message").and_then(Value::as_str);
    let data_retryable = original
        .pointer("/data/retryable")
        .map(js_truthy)
        .unwrap_or(false);
    let data_kind = original.pointer("/data/kind").and_then(Value::as_str);

    let mut code = numeric_code.unwrap_or(-32000);
    let mut kind = KIND_SERVER_ERROR;
    let mut retryable = false;

    let mut message = if string_code == Some("ENOENT") {
        code = -32001;
        kind = KIND_SPAWN_ERROR;
        SPAWN_ENOENT_MESSAGE.to_string()
    } else if let Some(n) = numeric_code {
        match n {
            -32601 => with_tool_suffix("Method not found", ctx),
            -32602 => with_tool_suffix("Invalid params", ctx),
            -32603 => {
                retryable = true;
                with_tool_suffix("Internal error", ctx)
            }
            n if (-32099..=-32000).contains(&n) => {
                retryable = data_retryable;
                fallback_message(original, original_message)
            }
            _ => fallback_message(original, original_message),
        }
    } else {
        fallback_message(original, original_message)
    };

    if data_kind == Some(KIND_TOOL_ERROR) {
        kind = KIND_TOOL_ERROR;
        retryable = data_retryable;
    }

    message = single_line(&message);
    if message.is_empty() || message == DEGENERATE_MESSAGE {
        message = "Tool/server error".to_string();
    }

    let mut data = json!({
        "kind": kind,
        "retryable": retryable,
        "original": original.clone(),
    });
    if let Some(tool) = &ctx.tool_name {
        data["toolName"] = json!(tool);
    }
    if let Some(server) = &ctx.server_name {
        data["serverName"] = json!(server);
    }

    JsonRpcError {
        code,
        message,
        data: Some(data),
    }
}

fn passthrough_error(original: &Value) -> JsonRpcError {
    serde_json::from_value(original.clone()).unwrap_or_else(|_| JsonRpcError {
        code: original.get("code").and_then(Value::as_i64).unwrap_or(-32000),
        message: match original {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        data: None,
    })
}

fn with_tool_suffix(base: &str, ctx: &ErrorContext) -> String {
    match &ctx.tool_name {
        Some(tool) => format!("{} for tool '{}'", base, tool),
        None => base.to_string(),
    }
}

/// Message when no fixed mapping applies: the original's message, a bare
/// string error verbatim, or the generic default.
fn fallback_message(original: &Value, original_message: Option<&str>) -> String {
    if let Some(m) = original_message {
        m.to_string()
    } else if let Value::String(s) = original {
        s.clone()
    } else {
        "Server error".to_string()
    }
}

fn single_line(message: &str) -> String {
    message
        .replace(['\n', '\r'], " ")
        .trim()
        .to_string()
}

/// JavaScript-style truthiness, for `data.retryable` coercion.
fn js_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
