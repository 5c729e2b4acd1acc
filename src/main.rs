//! mcp-wrapper - aggregating MCP proxy.
//!
//! Speaks JSON-RPC 2.0 on stdin/stdout toward the parent and fans out to
//! child MCP servers spawned as subprocesses. Child stderr is inherited so
//! their diagnostics flow through unchanged; the proxy's own logs go to
//! stderr as well.

use clap::Parser;
use mcp_wrapper::cli::{Cli, Invocation};
use mcp_wrapper::config::{self, WrapperOptions};
use mcp_wrapper::mcp::codec::FrameDecoder;
use mcp_wrapper::mcp::{Aggregator, ChildClient};
use serde_json::Value;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let options = WrapperOptions::from_env();
    init_tracing(&options);

    let specs = match cli.invocation() {
        Invocation::Passthrough(spec) => vec![spec],
        Invocation::Config => match config::discover() {
            Some((path, specs)) => {
                debug!(path = %path.display(), servers = specs.len(), "using configuration");
                specs
            }
            None => {
                warn!("no configuration found; serving with no children");
                Vec::new()
            }
        },
    };

    let (parent_tx, parent_rx) = mpsc::channel::<String>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Value>(64);
    let (events_tx, events_rx) = mpsc::channel(64);

    let writer = spawn_stdout_writer(parent_rx);
    spawn_stdin_reader(inbound_tx);

    let children: Vec<Arc<ChildClient>> = specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| {
            ChildClient::spawn(index, spec, events_tx.clone(), parent_tx.clone())
        })
        .collect();
    drop(events_tx);

    if options.summary {
        print_summary(&children);
    }

    let aggregator = Aggregator::new(children, parent_tx, options);
    let code = aggregator.run(inbound_rx, events_rx).await;

    // Dropping the aggregator releases the last outbound sender; joining the
    // writer guarantees buffered responses reach the parent before exit.
    drop(aggregator);
    let _ = writer.join();
    std::process::exit(code);
}

fn init_tracing(options: &WrapperOptions) {
    let default = if options.debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// One startup line on stderr naming each child and whether it spawned.
fn print_summary(children: &[Arc<ChildClient>]) {
    let mut parts: Vec<String> = Vec::new();
    for child in children {
        if child.spawned() {
            parts.push(child.display_name().to_string());
        } else {
            parts.push(format!("{} (failed to spawn)", child.display_name()));
        }
    }
    if parts.is_empty() {
        eprintln!("mcp-wrapper: no children configured");
    } else {
        eprintln!("mcp-wrapper: serving {}", parts.join(", "));
    }
}

/// Blocking stdin reader on its own thread, bridged into the runtime.
fn spawn_stdin_reader(tx: mpsc::Sender<Value>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 8192];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    while let Some(value) = decoder.next_message() {
                        if tx.blocking_send(value).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
}

/// Blocking stdout writer: every outbound message funnels through one
/// channel, so writes are atomic at message granularity.
fn spawn_stdout_writer(mut rx: mpsc::Receiver<String>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut stdout = std::io::stdout().lock();
        while let Some(msg) = rx.blocking_recv() {
            if stdout.write_all(msg.as_bytes()).is_err() {
                break;
            }
            if stdout.flush().is_err() {
                break;
            }
        }
    })
}
