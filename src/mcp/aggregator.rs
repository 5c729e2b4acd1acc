//! Parent-side dispatch: the aggregating proxy core.
//!
//! One dispatcher consumes decoded parent messages and child events. Fan-out
//! methods (`initialize`, `tools/list`) broadcast to every child under a
//! wall-clock timeout and reduce the responses; `tools/call` and unknown
//! methods are forwarded with the parent's id reused verbatim, and the
//! matching child response is correlated back through the routing table.

use super::child::{ChildClient, ChildEvent};
use super::codec::encode_line;
use super::errors::{normalize_error, ErrorContext, KIND_SERVER_ERROR};
use super::schema::normalize_tools;
use super::types::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpMessage, RequestId,
    FALLBACK_PROTOCOL_VERSION, SERVER_NAME,
};
use crate::config::WrapperOptions;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Per-request context kept for contextual error shaping.
#[derive(Debug, Clone)]
struct RequestCtx {
    method: String,
    params: Option<Value>,
}

/// The three routing tables. `parent_to_child` and `parent_ctx` are inserted
/// and removed together for forwarded requests; `tool_to_child` maps a
/// published tool name to (child index, original name) and is rebuilt by
/// every `tools/list`.
#[derive(Debug, Default)]
struct RouteState {
    tool_to_child: HashMap<String, (usize, String)>,
    parent_to_child: HashMap<RequestId, usize>,
    parent_ctx: HashMap<RequestId, RequestCtx>,
}

pub struct Aggregator {
    children: Vec<Arc<ChildClient>>,
    state: Mutex<RouteState>,
    parent_tx: mpsc::Sender<String>,
    options: WrapperOptions,
    /// Children whose subprocess is currently running.
    live: AtomicUsize,
    last_exit: std::sync::Mutex<Option<i32>>,
}

impl Aggregator {
    pub fn new(
        children: Vec<Arc<ChildClient>>,
        parent_tx: mpsc::Sender<String>,
        options: WrapperOptions,
    ) -> Arc<Self> {
        let live = children.iter().filter(|c| c.spawned()).count();
        Arc::new(Self {
            children,
            state: Mutex::new(RouteState::default()),
            parent_tx,
            options,
            live: AtomicUsize::new(live),
            last_exit: std::sync::Mutex::new(None),
        })
    }

    pub fn children(&self) -> &[Arc<ChildClient>] {
        &self.children
    }

    /// Dispatcher loop. Returns the process exit code: the last child's exit
    /// status once no running child remains, or zero when the parent stream
    /// closes with nothing left to wait for.
    pub async fn run(
        self: &Arc<Self>,
        mut inbound_rx: mpsc::Receiver<Value>,
        mut events_rx: mpsc::Receiver<ChildEvent>,
    ) -> i32 {
        let mut parent_open = true;
        let mut events_open = true;
        loop {
            tokio::select! {
                inbound = inbound_rx.recv(), if parent_open => match inbound {
                    Some(value) => self.handle_parent_message(value).await,
                    None => {
                        debug!("parent stream closed");
                        parent_open = false;
                        if self.live.load(Ordering::SeqCst) == 0 {
                            return self.exit_code();
                        }
                    }
                },
                event = events_rx.recv(), if events_open => match event {
                    Some(event) => {
                        if let Some(code) = self.handle_event(event).await {
                            return code;
                        }
                    }
                    // No child ever held the channel (or all tasks are
                    // gone); keep serving the parent until its stream ends.
                    None => events_open = false,
                },
                else => return self.exit_code(),
            }
        }
    }

    fn exit_code(&self) -> i32 {
        self.last_exit.lock().map(|g| g.unwrap_or(0)).unwrap_or(0)
    }

    /// One decoded message from the parent stream.
    pub async fn handle_parent_message(self: &Arc<Self>, value: Value) {
        let raw = value.clone();
        let message = match McpMessage::from_json(value) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable parent message");
                return;
            }
        };

        match message {
            McpMessage::Request(request) => self.handle_parent_request(request).await,
            McpMessage::Notification(notification) => {
                self.broadcast(raw, &notification.method).await
            }
            McpMessage::Response(response) => {
                debug!(id = %response.id, "ignoring unsolicited response from parent");
            }
        }
    }

    async fn handle_parent_request(self: &Arc<Self>, request: JsonRpcRequest) {
        debug!(method = %request.method, id = %request.id, "parent request");
        self.state.lock().await.parent_ctx.insert(
            request.id.clone(),
            RequestCtx {
                method: request.method.clone(),
                params: request.params.clone(),
            },
        );

        match request.method.as_str() {
            "initialize" => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.handle_initialize(request).await });
            }
            "tools/list" => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.handle_tools_list(request).await });
            }
            "tools/call" => self.handle_tools_call(request).await,
            "ping" => self.reply_result(request.id, json!({"ok": true})).await,
            _ => self.forward_to_first_child(request).await,
        }
    }

    /// Fan out `initialize` to every child, bounded by one overall timeout.
    async fn handle_initialize(self: &Arc<Self>, request: JsonRpcRequest) {
        let params = request.params.clone();

        if self.children.is_empty() {
            let result = self.minimal_initialize_result(params.as_ref());
            self.reply_result(request.id, result).await;
            return;
        }

        let calls = self
            .children
            .iter()
            .map(|child| child.request("initialize", params.clone()));

        match tokio::time::timeout(self.options.init_timeout, join_all(calls)).await {
            Ok(results) => {
                let first_success = results.iter().find_map(|r| match r {
                    Ok(response) if response.error.is_none() => response.result.clone(),
                    _ => None,
                });

                if let Some(result) = first_success {
                    let coerced = self.coerce_initialize_result(result, params.as_ref());
                    self.reply_result(request.id, coerced).await;
                } else {
                    let first_error = results
                        .into_iter()
                        .map(|r| match r {
                            Ok(response) => response
                                .error
                                .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
                                .unwrap_or(Value::Null),
                            Err(raw) => raw,
                        })
                        .next()
                        .unwrap_or(Value::Null);
                    let ctx = ErrorContext {
                        method: Some("initialize".to_string()),
                        ..Default::default()
                    };
                    let err =
                        normalize_error(&first_error, &ctx, self.options.error_passthrough);
                    self.reply_error(request.id, err).await;
                }
            }
            Err(_) => {
                debug!("initialize fan-out timed out, synthesizing reply");
                let result = self.minimal_initialize_result(params.as_ref());
                self.reply_result(request.id, result).await;
            }
        }
    }

    /// First successful child result, made presentable: a protocol version is
    /// always present, tools capability is advertised, and the proxy speaks
    /// under one server name.
    fn coerce_initialize_result(&self, mut result: Value, params: Option<&Value>) -> Value {
        if !result.is_object() {
            result = json!({});
        }
        if let Some(obj) = result.as_object_mut() {
            if !obj.get("protocolVersion").map(Value::is_string).unwrap_or(false) {
                obj.insert(
                    "protocolVersion".to_string(),
                    json!(requested_protocol_version(params)),
                );
            }

            let capabilities = obj
                .entry("capabilities".to_string())
                .or_insert_with(|| json!({}));
            if !capabilities.is_object() {
                *capabilities = json!({});
            }
            if capabilities.get("tools").is_none() {
                capabilities["tools"] = json!({"listChanged": false});
            }

            let server_info = obj
                .entry("serverInfo".to_string())
                .or_insert_with(|| json!({"version": env!("CARGO_PKG_VERSION")}));
            if !server_info.is_object() {
                *server_info = json!({"version": env!("CARGO_PKG_VERSION")});
            }
            server_info["name"] = json!(SERVER_NAME);
        }
        result
    }

    fn minimal_initialize_result(&self, params: Option<&Value>) -> Value {
        json!({
            "protocolVersion": requested_protocol_version(params),
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")},
        })
    }

    /// Fan out `tools/list`, merge the catalogs under prefixed names, and
    /// normalize the merged result. A child that errors or times out simply
    /// contributes nothing.
    async fn handle_tools_list(self: &Arc<Self>, request: JsonRpcRequest) {
        let params = request.params.clone();
        let per_child = self.options.tools_list_timeout;

        let calls = self.children.iter().map(|child| {
            let params = params.clone();
            async move {
                tokio::time::timeout(per_child, child.request("tools/list", params))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
            }
        });
        let results = join_all(calls).await;

        let mut merged: Vec<Value> = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.tool_to_child.clear();

            for (child, result) in self.children.iter().zip(results) {
                let Some(response) = result else {
                    debug!(server = %child.display_name(), "child skipped in tools/list");
                    continue;
                };
                if response.error.is_some() {
                    debug!(server = %child.display_name(), "child errored in tools/list");
                    continue;
                }
                let tools = response
                    .result
                    .as_ref()
                    .and_then(|r| r.get("tools"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                for mut tool in tools {
                    let Some(name) = tool.get("name").and_then(Value::as_str).map(str::to_string)
                    else {
                        // Best-effort preservation of nameless entries.
                        merged.push(tool);
                        continue;
                    };

                    let published = format!("{}__{}", child.key, name);
                    if state.tool_to_child.contains_key(&published) {
                        debug!(tool = %published, "duplicate published name dropped");
                        continue;
                    }
                    state
                        .tool_to_child
                        .insert(published.clone(), (child.index, name));
                    tool["name"] = json!(published);
                    merged.push(tool);
                }
            }
        }

        let tools = normalize_tools(&merged);
        self.reply_result(request.id, json!({"tools": tools})).await;
    }

    /// Route a tool call to the child that published it, rewriting the name
    /// back to the child's own.
    async fn handle_tools_call(self: &Arc<Self>, request: JsonRpcRequest) {
        let published = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let target = {
            let state = self.state.lock().await;
            state.tool_to_child.get(&published).cloned()
        };

        let Some((child_index, original)) = target else {
            self.reply_error(request.id, tool_not_found(&published)).await;
            return;
        };

        let child = &self.children[child_index];
        self.state
            .lock()
            .await
            .parent_to_child
            .insert(request.id.clone(), child_index);

        let mut params = request.params.clone().unwrap_or_else(|| json!({}));
        params["name"] = json!(original);
        let forwarded = JsonRpcRequest::new(request.id.clone(), "tools/call", Some(params));

        if let Err(raw) = child.forward(&forwarded).await {
            let ctx = ErrorContext::for_tool(published, child.display_name());
            let err = normalize_error(&raw, &ctx, self.options.error_passthrough);
            self.reply_error(request.id, err).await;
        }
    }

    /// Methods the proxy does not implement ride through to the first child.
    async fn forward_to_first_child(self: &Arc<Self>, request: JsonRpcRequest) {
        let Some(child) = self.children.first() else {
            let err = JsonRpcError::method_not_found(&request.method);
            self.reply_error(request.id, err).await;
            return;
        };

        self.state
            .lock()
            .await
            .parent_to_child
            .insert(request.id.clone(), child.index);

        if let Err(raw) = child.forward(&request).await {
            let ctx = ErrorContext {
                method: Some(request.method.clone()),
                server_name: Some(child.display_name().to_string()),
                ..Default::default()
            };
            let err = normalize_error(&raw, &ctx, self.options.error_passthrough);
            self.reply_error(request.id, err).await;
        }
    }

    /// Parent notifications go to every child, byte-for-byte.
    async fn broadcast(&self, raw: Value, method: &str) {
        debug!(method, "broadcasting notification");
        for child in &self.children {
            if let Err(e) = child.send_raw(&raw).await {
                debug!(server = %child.display_name(), error = %e, "notify failed");
            }
        }
    }

    /// One child event. Returns the process exit code once the last running
    /// child is gone.
    pub async fn handle_event(self: &Arc<Self>, event: ChildEvent) -> Option<i32> {
        match event {
            ChildEvent::Routed { child, response } => {
                self.handle_routed_response(child, response).await;
                None
            }
            ChildEvent::Request { child, request } => {
                self.handle_child_request(child, request).await;
                None
            }
            ChildEvent::Exited { child, status } => self.handle_child_exit(child, status).await,
        }
    }

    /// A request initiated by a child toward the proxy. The proxy implements
    /// no server-to-client callbacks and does not proxy these to the parent
    /// (the parent would answer with an id the routing tables never issued),
    /// so the child gets `-32601`.
    async fn handle_child_request(self: &Arc<Self>, child_index: usize, request: JsonRpcRequest) {
        let Some(child) = self.children.get(child_index) else {
            return;
        };
        debug!(server = %child.display_name(), method = %request.method, "refusing child request");
        let response =
            JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(&request.method));
        match serde_json::to_value(&response) {
            Ok(value) => {
                if let Err(e) = child.send_raw(&value).await {
                    debug!(server = %child.display_name(), error = %e, "refusal not delivered");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize refusal"),
        }
    }

    /// A child response whose id did not match any of the child's local
    /// requests: correlate it against the forwarded-request table.
    async fn handle_routed_response(self: &Arc<Self>, child_index: usize, response: JsonRpcResponse) {
        let ctx = {
            let mut state = self.state.lock().await;
            match state.parent_to_child.get(&response.id) {
                Some(&owner) if owner == child_index => {
                    state.parent_to_child.remove(&response.id);
                    state.parent_ctx.remove(&response.id)
                }
                Some(_) => {
                    warn!(id = %response.id, child = child_index, "response from wrong child, dropped");
                    return;
                }
                None => {
                    warn!(id = %response.id, child = child_index, "response for unknown id, dropped");
                    return;
                }
            }
        };

        let is_tool_call = ctx
            .as_ref()
            .map(|c| c.method == "tools/call")
            .unwrap_or(false);

        if is_tool_call {
            if let Some(error) = &response.error {
                let tool_name = ctx
                    .as_ref()
                    .and_then(|c| c.params.as_ref())
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let server_name = self.children[child_index].display_name().to_string();
                let raw = serde_json::to_value(error).unwrap_or(Value::Null);
                let wrapped = normalize_error(
                    &raw,
                    &ErrorContext::for_tool(tool_name, server_name),
                    self.options.error_passthrough,
                );
                self.send_response(JsonRpcResponse::error(response.id, wrapped))
                    .await;
                return;
            }
        }

        self.send_response(response).await;
    }

    async fn handle_child_exit(self: &Arc<Self>, child_index: usize, status: Option<i32>) -> Option<i32> {
        let child = &self.children[child_index];
        warn!(server = %child.display_name(), status = ?status, "child exited");

        if let Ok(mut last) = self.last_exit.lock() {
            *last = status;
        }

        // Fail forwarded requests that will never get a response, and retire
        // the dead child's tools so calls report "Tool not found".
        let orphaned: Vec<(RequestId, Option<RequestCtx>)> = {
            let mut state = self.state.lock().await;
            state
                .tool_to_child
                .retain(|_, (owner, _)| *owner != child_index);
            let ids: Vec<RequestId> = state
                .parent_to_child
                .iter()
                .filter(|(_, &owner)| owner == child_index)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .map(|id| {
                    state.parent_to_child.remove(&id);
                    let ctx = state.parent_ctx.remove(&id);
                    (id, ctx)
                })
                .collect()
        };

        for (id, ctx) in orphaned {
            let raw = json!({
                "code": -32000,
                "message": "server exited before responding",
            });
            let ctx = ErrorContext {
                method: ctx.as_ref().map(|c| c.method.clone()),
                server_name: Some(child.display_name().to_string()),
                ..Default::default()
            };
            let err = normalize_error(&raw, &ctx, self.options.error_passthrough);
            self.reply_error(id, err).await;
        }

        let remaining = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 {
            debug!("no running children remain");
            return Some(status.unwrap_or(0));
        }
        None
    }

    async fn reply_result(&self, id: RequestId, result: Value) {
        self.clear_routes(&id).await;
        self.send_response(JsonRpcResponse::success(id, result)).await;
    }

    async fn reply_error(&self, id: RequestId, error: JsonRpcError) {
        self.clear_routes(&id).await;
        self.send_response(JsonRpcResponse::error(id, error)).await;
    }

    async fn clear_routes(&self, id: &RequestId) {
        let mut state = self.state.lock().await;
        state.parent_to_child.remove(id);
        state.parent_ctx.remove(id);
    }

    async fn send_response(&self, response: JsonRpcResponse) {
        match serde_json::to_value(&response) {
            Ok(value) => {
                let _ = self.parent_tx.send(encode_line(&value)).await;
            }
            Err(e) => warn!(error = %e, "failed to serialize response"),
        }
    }
}

fn requested_protocol_version(params: Option<&Value>) -> String {
    params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(FALLBACK_PROTOCOL_VERSION)
        .to_string()
}

/// The missing-tool envelope. Built directly rather than through
/// [`normalize_error`], which would rewrite a `-32601` message to
/// "Method not found".
fn tool_not_found(name: &str) -> JsonRpcError {
    let message = format!("Tool not found: {}", name);
    JsonRpcError {
        code: -32601,
        message: message.clone(),
        data: Some(json!({
            "kind": KIND_SERVER_ERROR,
            "retryable": false,
            "original": {"code": -32601, "message": message},
            "toolName": name,
        })),
    }
}
