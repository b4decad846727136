//! `dh-vm-runner`: the in-VM exec daemon (§4.3). Bundled into the rootfs
//! and started by the init script, it serves `ExecRequest`/`ExecReply`
//! (§6.5) over vsock port 10000, forwarding each request to a persistent
//! local engine subprocess the same way the host's embedded mode talks to
//! one over stdio (`apps/dh/src/engine/embedded.rs`) — the engine itself
//! stays out of scope (it owns table introspection and the traceback
//! conversion of step 4/5; this daemon only owns transport, file
//! materialization, and the accept loop that must survive a snapshot
//! restore).

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use base64::Engine as _;
use clap::Parser;
use dh_types::vsock_proto::{ExecReply, ExecRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tokio_vsock::{VsockAddr, VsockListener};

/// `0xFFFFFFFF`: any CID may connect. Matches Linux's `VMADDR_CID_ANY`.
const VMADDR_CID_ANY: u32 = 0xFFFF_FFFF;

#[derive(Parser)]
struct Args {
    /// The bundled engine-hosting program to spawn and keep alive for the
    /// life of this daemon (§1 Non-goals: "the Deephaven engine itself").
    #[arg(long = "engine-runner")]
    engine_runner: std::path::PathBuf,
    #[arg(long = "version")]
    version: String,
    #[arg(long = "port", default_value_t = 10000)]
    port: u32,
}

/// Owns the long-lived engine subprocess. One instance is shared across
/// every accepted connection, since the engine session (and its table
/// namespace) must persist across requests within the life of the VM.
struct LocalEngine {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
    _child: Mutex<Child>,
}

impl LocalEngine {
    fn spawn(engine_runner: &std::path::Path, version: &str) -> std::io::Result<Self> {
        let mut command = tokio::process::Command::new(engine_runner);
        command
            .arg("--version")
            .arg(version)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            _child: Mutex::new(child),
        })
    }

    async fn execute(&self, request: &ExecRequest) -> ExecReply {
        match self.execute_inner(request).await {
            Ok(reply) => reply,
            Err(e) => ExecReply::script_error(String::new(), String::new(), e.to_string()),
        }
    }

    async fn execute_inner(&self, request: &ExecRequest) -> anyhow::Result<ExecReply> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
        }

        let mut reply_line = String::new();
        let mut stdout = self.stdout.lock().await;
        let n = stdout.read_line(&mut reply_line).await?;
        if n == 0 {
            anyhow::bail!("engine runner closed stdout");
        }
        Ok(serde_json::from_str(&reply_line)?)
    }
}

/// Writes each `files` entry (relative path -> base64 content) under `/`
/// before execution, per §4.2.3's in-request batching fast path.
fn materialize_files(files: &Option<BTreeMap<String, String>>) -> std::io::Result<()> {
    let Some(files) = files else {
        return Ok(());
    };
    for (rel_path, encoded) in files {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let dest = std::path::Path::new("/").join(rel_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, decoded)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    let engine = Arc::new(LocalEngine::spawn(&args.engine_runner, &args.version)?);

    let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, args.port))?;
    tracing::info!(port = args.port, "dh-vm-runner: listening on vsock");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tracing::debug!(?peer, "accepted connection");
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, engine).await {
                tracing::debug!(error = %e, "connection ended");
            }
        });
    }
}

/// Serves every request on one connection until the peer closes it
/// (steps 1-6 of §4.3). A connection normally carries exactly one
/// request from the host's one-shot-per-exec dial pattern, but the loop
/// tolerates a peer that sends more than one line.
async fn serve_connection(
    stream: tokio_vsock::VsockStream,
    engine: Arc<LocalEngine>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<ExecRequest>(trimmed) {
            Ok(request) => {
                if let Err(e) = materialize_files(&request.files) {
                    ExecReply::script_error(String::new(), String::new(), e.to_string())
                } else {
                    engine.execute(&request).await
                }
            }
            Err(e) => ExecReply::script_error(String::new(), String::new(), format!("malformed request: {e}")),
        };

        let mut out = serde_json::to_string(&reply)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
}
