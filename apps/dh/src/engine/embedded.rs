//! Embedded mode: spawns the engine in a child process and drives it with
//! the same newline-delimited JSON shape vsock uses at runtime (§6.5),
//! just over stdio pipes instead of a vsock channel. The actual engine
//! program is an external collaborator (§1 Non-goals: "The Deephaven
//! engine itself"); this type owns only the subprocess lifecycle and
//! wire protocol.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dh_types::repl_proto::TableSummary;
use dh_types::vsock_proto::{ExecReply, ExecRequest};
use dh_types::DhError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;

pub struct EmbeddedEngine {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
    request_seq: AtomicU64,
}

impl EmbeddedEngine {
    /// Spawns `engine_runner_bin` (the bundled embedded-runner program,
    /// e.g. a Python process hosting the engine in-process) in its own
    /// process group with stderr discarded, matching the REPL session's
    /// spawn discipline (§4.4.2 step 1) so a crashing child never
    /// corrupts the caller's terminal.
    pub fn spawn(engine_runner_bin: &std::path::Path, version: &str) -> Result<Self, DhError> {
        let mut command = tokio::process::Command::new(engine_runner_bin);
        command
            .arg("--version")
            .arg(version)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::from)?;
                    Ok(())
                });
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| DhError::prereq_not_met(format!("failed to spawn engine runner: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DhError::prereq_not_met("engine runner has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DhError::prereq_not_met("engine runner has no stdout"))?;

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            request_seq: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Engine for EmbeddedEngine {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecReply, DhError> {
        let _seq = self.request_seq.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_string(request)
            .map_err(|e| DhError::runner_exited(format!("cannot encode request: {e}")))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| DhError::runner_exited(format!("write to engine runner failed: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| DhError::runner_exited(e.to_string()))?;
        }

        let mut stdout = self.stdout.lock().await;
        let mut reply_line = String::new();
        let n = stdout
            .read_line(&mut reply_line)
            .await
            .map_err(|e| DhError::runner_exited(e.to_string()))?;
        if n == 0 {
            return Err(DhError::runner_exited("engine runner closed stdout"));
        }
        serde_json::from_str(&reply_line)
            .map_err(|e| DhError::runner_exited(format!("malformed reply from engine runner: {e}")))
    }

    async fn list_tables(&self) -> Result<Vec<TableSummary>, DhError> {
        let reply = self
            .execute(&ExecRequest {
                code: String::new(),
                show_tables: true,
                show_table_meta: false,
                files: None,
            })
            .await?;
        Ok(reply
            .tables
            .into_iter()
            .map(|t| TableSummary {
                name: t.name,
                row_count: t.row_count,
                is_refreshing: t.is_refreshing,
            })
            .collect())
    }
}

impl Drop for EmbeddedEngine {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.start_kill();
        }
    }
}

use super::Engine;
