//! `dh-repl-runner`: the host-side REPL runner subprocess (§4.4.1-§4.4.3).
//! Speaks `dh_types::repl_proto::{Command, Reply}` newline-delimited JSON
//! on stdin/stdout. Wraps one of two backends depending on how it was
//! launched:
//!
//! - `--engine-runner <bin>`: spawns the bundled (out-of-scope) engine
//!   host directly over stdio, using the same `vsock_proto` wire as the
//!   host's embedded mode (`apps/dh/src/engine/embedded.rs`) — this keeps
//!   engine state alive across every command for the life of the session.
//! - `--vm` / `--remote <addr>`: shells out to the `dh` binary's own
//!   `exec` subcommand per command, reusing its already-built VM/remote
//!   orchestration rather than duplicating it. VM-mode exec is inherently
//!   stateless per call (every `exec --vm` restores and tears down a
//!   snapshot), so this is not a shortcut — a VM-backed REPL session
//!   genuinely cannot keep engine-side variable bindings across commands
//!   without a warm pool pinned to one session, which is out of scope.

mod backend;
mod subscription;

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use dh_types::repl_proto::{Command, Reply, ServerInfo, TableSummary};
use dh_types::vsock_proto::TablePreview;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use backend::{Backend, CliBackend, EmbeddedBackend};
use subscription::SubscriptionManager;

#[derive(Parser)]
struct Args {
    #[arg(long = "version")]
    version: String,
    #[arg(long = "engine-runner")]
    engine_runner: Option<std::path::PathBuf>,
    #[arg(long = "remote")]
    remote: Option<String>,
    #[arg(long = "vm")]
    vm: bool,
}

/// Serializes writes to stdout: the request/reply loop and the
/// subscription poll thread both emit lines and must not interleave
/// partial writes (§4.4.3: "a single write-lock guards stdout").
struct Stdout {
    inner: Mutex<std::io::Stdout>,
}

impl Stdout {
    fn new() -> Self {
        Self { inner: Mutex::new(std::io::stdout()) }
    }

    async fn write_reply(&self, reply: &Reply) {
        let mut line = serde_json::to_string(reply).unwrap_or_default();
        line.push('\n');
        let mut out = self.inner.lock().await;
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    let backend: Arc<dyn Backend> = if let Some(engine_runner) = &args.engine_runner {
        Arc::new(EmbeddedBackend::spawn(engine_runner, &args.version)?)
    } else {
        let dh_bin = sibling_dh_binary();
        Arc::new(CliBackend::new(dh_bin, args.version.clone(), args.remote.clone(), args.vm))
    };

    let stdout = Arc::new(Stdout::new());
    let known_tables: Arc<Mutex<std::collections::HashMap<String, TablePreview>>> =
        Arc::new(Mutex::new(std::collections::HashMap::new()));
    let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(&backend), Arc::clone(&stdout)));

    stdout.write_reply(&Reply::Ready).await;

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let command: Command = match serde_json::from_str(trimmed) {
            Ok(c) => c,
            Err(_) => continue,
        };

        if matches!(command, Command::Shutdown { .. }) {
            subscriptions.stop().await;
            stdout.write_reply(&Reply::ShutdownAck).await;
            break;
        }

        let backend = Arc::clone(&backend);
        let stdout = Arc::clone(&stdout);
        let known_tables = Arc::clone(&known_tables);
        let subscriptions = Arc::clone(&subscriptions);
        tokio::spawn(async move {
            let reply = handle_command(command, &backend, &known_tables, &subscriptions).await;
            stdout.write_reply(&reply).await;
        });
    }

    Ok(())
}

fn sibling_dh_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("dh")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| std::path::PathBuf::from("dh"))
}

async fn handle_command(
    command: Command,
    backend: &Arc<dyn Backend>,
    known_tables: &Arc<Mutex<std::collections::HashMap<String, TablePreview>>>,
    subscriptions: &Arc<SubscriptionManager>,
) -> Reply {
    match command {
        Command::Execute { id, code } => {
            let reply = backend.exec(&code, true, true).await;
            match reply {
                Ok(r) => {
                    let mut cache = known_tables.lock().await;
                    let mut new_tables = Vec::new();
                    for t in &r.tables {
                        if !cache.contains_key(&t.name) {
                            new_tables.push(t.name.clone());
                        }
                        cache.insert(t.name.clone(), t.clone());
                    }
                    Reply::Result {
                        id,
                        result_repr: r.result_repr,
                        stdout: r.stdout,
                        stderr: r.stderr,
                        new_tables,
                    }
                }
                Err(e) => Reply::Error { id, message: e.to_string() },
            }
        }
        Command::ListTables { id } => {
            let cache = known_tables.lock().await;
            let tables = cache
                .values()
                .map(|t| TableSummary {
                    name: t.name.clone(),
                    row_count: t.row_count,
                    is_refreshing: t.is_refreshing,
                })
                .collect();
            Reply::Tables { id, tables }
        }
        Command::FetchTable { id, name, offset, limit } => {
            let preview = known_tables.lock().await.get(&name).cloned();
            match preview {
                Some(p) => Reply::TableData { id, window: subscription::preview_to_window(&p, offset, limit) },
                None => Reply::Error { id, message: format!("unknown table {name}") },
            }
        }
        Command::ServerInfo { id } => Reply::ServerInfoReply {
            id,
            info: ServerInfo {
                engine_version: backend.engine_version().to_string(),
                mode: backend.mode_name().to_string(),
                connected: true,
            },
        },
        Command::Subscribe { id, name, offset, limit } => {
            subscriptions.subscribe(name, offset, limit, Arc::clone(known_tables)).await;
            Reply::Tables { id, tables: vec![] }
        }
        Command::Unsubscribe { id, name } => {
            subscriptions.unsubscribe(&name).await;
            Reply::Tables { id, tables: vec![] }
        }
        Command::Shutdown { id } => Reply::ServerInfoReply {
            id,
            info: ServerInfo { engine_version: String::new(), mode: String::new(), connected: false },
        },
    }
}
