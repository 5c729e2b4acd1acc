//! One MCP child server: subprocess lifecycle, request correlation, and
//! inbound dispatch.
//!
//! Each child owns a writer task (all stdin writes funnel through one
//! channel, so concurrent senders never interleave) and a reader task that
//! decodes the child's stdout and routes each message: responses to local
//! requests resolve their pending future, notifications are forwarded to
//! the parent verbatim, and everything else (responses to forwarded parent
//! requests, requests initiated by the child) is handed to the aggregator.
//!
//! Local request ids are string-shaped (`"wrapper:<n>"`), so they can never
//! collide with a parent id forwarded verbatim onto the same stdin.

use super::codec::{encode_line, FrameDecoder};
use super::errors::spawn_failure;
use super::types::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpMessage, RequestId,
};
use crate::config::ChildSpec;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

/// Events a child surfaces to the aggregator's dispatcher.
#[derive(Debug)]
pub enum ChildEvent {
    /// A response whose id matched no local request: it belongs to a
    /// forwarded parent request.
    Routed {
        child: usize,
        response: JsonRpcResponse,
    },
    /// A request the child initiated toward the proxy.
    Request {
        child: usize,
        request: JsonRpcRequest,
    },
    /// The subprocess exited.
    Exited { child: usize, status: Option<i32> },
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<JsonRpcResponse, Value>>,
}

type PendingMap = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;

/// Runtime handle for one child server.
///
/// A spawn failure does not remove the child from the aggregator's list; the
/// failure is captured here and every subsequent send yields it, so the
/// child still participates in routing decisions (and error reporting) while
/// contributing nothing to the catalog.
pub struct ChildClient {
    pub index: usize,
    pub spec: ChildSpec,
    pub key: String,
    writer_tx: Option<mpsc::Sender<String>>,
    spawn_error: Option<Value>,
    pending: PendingMap,
    next_id: AtomicI64,
}

impl ChildClient {
    /// Spawn the subprocess and start its reader/writer tasks. stderr is
    /// inherited: children speak human-readable diagnostics there and they
    /// flow through unchanged.
    pub fn spawn(
        index: usize,
        spec: ChildSpec,
        events_tx: mpsc::Sender<ChildEvent>,
        parent_tx: mpsc::Sender<String>,
    ) -> Arc<Self> {
        let key = spec.key();
        let spawned = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %spec.command, error = %e, "failed to spawn child");
                let raw = spawn_failure(&e, &spec.command);
                return Arc::new(Self {
                    index,
                    spec,
                    key,
                    writer_tx: None,
                    spawn_error: Some(raw),
                    pending: Arc::new(Mutex::new(HashMap::new())),
                    next_id: AtomicI64::new(1),
                });
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);

        if let Some(mut stdin) = stdin {
            let command = spec.command.clone();
            tokio::spawn(async move {
                while let Some(msg) = writer_rx.recv().await {
                    trace!(command = %command, "child TX: {}", msg.trim_end());
                    if let Err(e) = stdin.write_all(msg.as_bytes()).await {
                        warn!(command = %command, error = %e, "child stdin write failed");
                        break;
                    }
                    if let Err(e) = stdin.flush().await {
                        warn!(command = %command, error = %e, "child stdin flush failed");
                        break;
                    }
                }
            });
        }

        if let Some(mut stdout) = stdout {
            let pending = Arc::clone(&pending);
            let command = spec.command.clone();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let mut decoder = FrameDecoder::new();
                let mut buf = [0u8; 8192];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            decoder.push(&buf[..n]);
                            while let Some(value) = decoder.next_message() {
                                trace!(command = %command, "child RX: {}", value);
                                dispatch_inbound(index, value, &pending, &parent_tx, &events_tx)
                                    .await;
                            }
                        }
                    }
                }

                let status = child.wait().await.ok().and_then(|s| s.code());
                debug!(command = %command, status = ?status, "child exited");

                let mut pending = pending.lock().await;
                for (id, req) in pending.drain() {
                    debug!(command = %command, method = %req.method, %id, "failing request on child exit");
                    let _ = req.tx.send(Err(exit_error()));
                }
                drop(pending);

                let _ = events_tx.send(ChildEvent::Exited { child: index, status }).await;
            });
        }

        Arc::new(Self {
            index,
            spec,
            key,
            writer_tx: Some(writer_tx),
            spawn_error: None,
            pending,
            next_id: AtomicI64::new(1),
        })
    }

    pub fn spawned(&self) -> bool {
        self.spawn_error.is_none()
    }

    /// The child's display name for summaries and error context.
    pub fn display_name(&self) -> &str {
        self.spec.name.as_deref().unwrap_or(&self.spec.command)
    }

    /// Send a request with a locally generated id and wait for the matching
    /// response. The error side carries the raw failure for the normalizer.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, Value> {
        let writer_tx = self.writer()?;

        let id = RequestId::String(format!("wrapper:{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let request = JsonRpcRequest::new(id.clone(), method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );

        let encoded = encode_line(&serde_json::to_value(&request).map_err(|e| write_error(&e))?);
        if writer_tx.send(encoded).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(exit_error());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(exit_error()),
        }
    }

    /// Forward a parent request verbatim: same id, same params. The response
    /// comes back through the aggregator's routing table, not a local
    /// future.
    pub async fn forward(&self, request: &JsonRpcRequest) -> Result<(), Value> {
        let writer_tx = self.writer()?;
        let encoded = encode_line(&serde_json::to_value(request).map_err(|e| write_error(&e))?);
        writer_tx.send(encoded).await.map_err(|_| exit_error())
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Value> {
        let notification = JsonRpcNotification::new(method, params);
        let value = serde_json::to_value(&notification).map_err(|e| write_error(&e))?;
        self.send_raw(&value).await
    }

    /// Write one already-shaped message to the child, byte-for-byte faithful
    /// to the given value. Used when forwarding parent traffic verbatim.
    pub async fn send_raw(&self, value: &Value) -> Result<(), Value> {
        let writer_tx = self.writer()?;
        writer_tx
            .send(encode_line(value))
            .await
            .map_err(|_| exit_error())
    }

    fn writer(&self) -> Result<&mpsc::Sender<String>, Value> {
        if let Some(raw) = &self.spawn_error {
            return Err(raw.clone());
        }
        self.writer_tx.as_ref().ok_or_else(exit_error)
    }
}

async fn dispatch_inbound(
    index: usize,
    value: Value,
    pending: &PendingMap,
    parent_tx: &mpsc::Sender<String>,
    events_tx: &mpsc::Sender<ChildEvent>,
) {
    // Keep the raw value around so notifications can be forwarded verbatim.
    let raw = value.clone();
    let message = match McpMessage::from_json(value) {
        Ok(message) => message,
        Err(e) => {
            warn!(child = index, error = %e, "unclassifiable message from child");
            return;
        }
    };

    match message {
        McpMessage::Response(response) => {
            let entry = pending.lock().await.remove(&response.id);
            match entry {
                Some(req) => {
                    trace!(child = index, method = %req.method, "resolved local request");
                    let _ = req.tx.send(Ok(response));
                }
                None => {
                    // Not ours: a forwarded parent request shares this id.
                    // The aggregator owns the routing table and decides
                    // whether the id is known.
                    let _ = events_tx
                        .send(ChildEvent::Routed {
                            child: index,
                            response,
                        })
                        .await;
                }
            }
        }
        McpMessage::Notification(_) => {
            let _ = parent_tx.send(encode_line(&raw)).await;
        }
        McpMessage::Request(request) => {
            debug!(child = index, method = %request.method, "request from child");
            let _ = events_tx
                .send(ChildEvent::Request {
                    child: index,
                    request,
                })
                .await;
        }
    }
}

fn exit_error() -> Value {
    json!({
        "code": -32000,
        "message": "server exited before responding",
    })
}

fn write_error(e: &impl std::fmt::Display) -> Value {
    json!({
        "code": -32000,
        "message": format!("failed to encode message for child: {}", e),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh(script: &str) -> ChildSpec {
        ChildSpec::from_command("sh".to_string(), vec!["-c".to_string(), script.to_string()])
    }

    fn channels() -> (
        mpsc::Sender<ChildEvent>,
        mpsc::Receiver<ChildEvent>,
        mpsc::Sender<String>,
        mpsc::Receiver<String>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (parent_tx, parent_rx) = mpsc::channel(8);
        (events_tx, events_rx, parent_tx, parent_rx)
    }

    #[tokio::test]
    async fn spawn_failure_is_captured_not_fatal() {
        let (events_tx, _events_rx, parent_tx, _parent_rx) = channels();
        let spec = ChildSpec::from_command("mcp-wrapper-test-no-such-binary".to_string(), vec![]);
        let child = ChildClient::spawn(0, spec, events_tx, parent_tx);

        assert!(!child.spawned());
        let err = child.request("tools/list", None).await.unwrap_err();
        assert_eq!(err["code"], "ENOENT");
    }

    #[tokio::test]
    async fn request_resolves_matching_response() {
        let (events_tx, _events_rx, parent_tx, _parent_rx) = channels();
        let script = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":"wrapper:1","result":{"ok":true}}'"#;
        let child = ChildClient::spawn(0, sh(script), events_tx, parent_tx);

        let response = timeout(Duration::from_secs(5), child.request("ping", None))
            .await
            .expect("no response")
            .expect("request failed");
        assert_eq!(response.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn exit_drains_pending_and_reports_status() {
        let (events_tx, mut events_rx, parent_tx, _parent_rx) = channels();
        let child = ChildClient::spawn(0, sh("read x; exit 3"), events_tx, parent_tx);

        let err = timeout(Duration::from_secs(5), child.request("tools/list", None))
            .await
            .expect("request did not fail on exit")
            .unwrap_err();
        assert_eq!(err["code"], -32000);

        let event = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("no exit event")
            .expect("events channel closed");
        match event {
            ChildEvent::Exited { child: 0, status } => assert_eq!(status, Some(3)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn notifications_forward_verbatim_to_parent() {
        let (events_tx, _events_rx, parent_tx, mut parent_rx) = channels();
        let script = r#"printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/progress","params":{"token":7},"extra":"kept"}'; sleep 1"#;
        let _child = ChildClient::spawn(0, sh(script), events_tx, parent_tx);

        let line = timeout(Duration::from_secs(5), parent_rx.recv())
            .await
            .expect("no forwarded notification")
            .expect("parent channel closed");
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "notifications/progress");
        assert_eq!(value["params"]["token"], 7);
        assert_eq!(value["extra"], "kept");
    }

    #[tokio::test]
    async fn forwarded_parent_id_routes_to_aggregator() {
        let (events_tx, mut events_rx, parent_tx, _parent_rx) = channels();
        let script = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":42,"result":{"echo":true}}'"#;
        let child = ChildClient::spawn(5, sh(script), events_tx, parent_tx);

        let request = JsonRpcRequest::new(42, "tools/call", Some(json!({"name": "x"})));
        child.forward(&request).await.unwrap();

        let event = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("no routed event")
            .expect("events channel closed");
        match event {
            ChildEvent::Routed { child: 5, response } => {
                assert_eq!(response.id, RequestId::Number(42));
                assert_eq!(response.result, Some(json!({"echo": true})));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn env_overlay_reaches_the_child() {
        let (events_tx, _events_rx, parent_tx, mut parent_rx) = channels();
        let mut spec = sh(
            r#"printf '{"jsonrpc":"2.0","method":"env/%s"}\n' "$WRAPPER_TEST_MARKER"; sleep 1"#,
        );
        spec.env
            .insert("WRAPPER_TEST_MARKER".to_string(), "overlaid".to_string());
        let _child = ChildClient::spawn(0, spec, events_tx, parent_tx);

        let line = timeout(Duration::from_secs(5), parent_rx.recv())
            .await
            .expect("no notification")
            .expect("parent channel closed");
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "env/overlaid");
    }

    #[tokio::test]
    async fn notify_carries_no_id() {
        let (events_tx, _events_rx, parent_tx, mut parent_rx) = channels();
        let script = r#"read line; printf '%s\n' "{\"jsonrpc\":\"2.0\",\"method\":\"echo/notify\",\"params\":$line}""#;
        let child = ChildClient::spawn(0, sh(script), events_tx, parent_tx);

        child
            .notify("notifications/cancelled", Some(json!({"requestId": 4})))
            .await
            .unwrap();

        let line = timeout(Duration::from_secs(5), parent_rx.recv())
            .await
            .expect("no echo")
            .expect("parent channel closed");
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["params"]["method"], "notifications/cancelled");
        assert!(value["params"].get("id").is_none());
        assert_eq!(value["params"]["params"]["requestId"], 4);
    }

    #[tokio::test]
    async fn child_initiated_request_is_handed_to_the_aggregator() {
        let (events_tx, mut events_rx, parent_tx, _parent_rx) = channels();
        let script = r#"printf '%s\n' '{"jsonrpc":"2.0","id":9,"method":"sampling/createMessage","params":{"k":1}}'; sleep 1"#;
        let _child = ChildClient::spawn(3, sh(script), events_tx, parent_tx);

        let event = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("no request event")
            .expect("events channel closed");
        match event {
            ChildEvent::Request { child: 3, request } => {
                assert_eq!(request.id, RequestId::Number(9));
                assert_eq!(request.method, "sampling/createMessage");
                assert_eq!(request.params, Some(json!({"k": 1})));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
