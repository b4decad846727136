//! The two ways this runner reaches "the local engine" (§4.4): directly
//! over stdio for embedded sessions, or by shelling out to the `dh`
//! binary's own `exec` subcommand for remote/VM sessions so the
//! already-built orchestration in `apps/dh` is reused rather than
//! duplicated here.

use std::process::Stdio;

use async_trait::async_trait;
use dh_types::vsock_proto::{ExecReply, ExecRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn exec(&self, code: &str, show_tables: bool, show_table_meta: bool) -> anyhow::Result<ExecReply>;
    fn engine_version(&self) -> &str;
    fn mode_name(&self) -> &str;
}

/// Spawns the bundled engine host directly and keeps it alive for the
/// session, exactly like `apps/dh/src/engine/embedded.rs`'s
/// `EmbeddedEngine` — the wire is the same `vsock_proto` newline JSON
/// contract, just reused here over a second stdio pipe.
pub struct EmbeddedBackend {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
    _child: Mutex<Child>,
    version: String,
}

impl EmbeddedBackend {
    pub fn spawn(engine_runner: &std::path::Path, version: &str) -> anyhow::Result<Self> {
        let mut command = tokio::process::Command::new(engine_runner);
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

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout"))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            _child: Mutex::new(child),
            version: version.to_string(),
        })
    }
}

#[async_trait]
impl Backend for EmbeddedBackend {
    async fn exec(&self, code: &str, show_tables: bool, show_table_meta: bool) -> anyhow::Result<ExecReply> {
        let request = ExecRequest {
            code: code.to_string(),
            show_tables,
            show_table_meta,
            files: None,
        };
        let mut line = serde_json::to_string(&request)?;
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

    fn engine_version(&self) -> &str {
        &self.version
    }

    fn mode_name(&self) -> &str {
        "embedded"
    }
}

/// Shells out to `dh exec` per call, reusing the host's remote/VM
/// orchestration. Each call is an independent process; engine state is
/// not preserved across commands (§4.1's VM exec is restore-then-destroy
/// per call, and the remote server owns its own session lifetime).
pub struct CliBackend {
    dh_bin: std::path::PathBuf,
    version: String,
    remote: Option<String>,
    vm: bool,
}

impl CliBackend {
    pub fn new(dh_bin: std::path::PathBuf, version: String, remote: Option<String>, vm: bool) -> Self {
        Self { dh_bin, version, remote, vm }
    }
}

#[async_trait]
impl Backend for CliBackend {
    async fn exec(&self, code: &str, show_tables: bool, show_table_meta: bool) -> anyhow::Result<ExecReply> {
        let mut command = tokio::process::Command::new(&self.dh_bin);
        command
            .arg("--json")
            .arg("exec")
            .arg("--code")
            .arg(code)
            .arg("--version")
            .arg(&self.version);
        if show_tables {
            command.arg("--show-tables");
        }
        if show_table_meta {
            command.arg("--show-table-meta");
        }
        if self.vm {
            command.arg("--vm");
        } else if let Some(addr) = &self.remote {
            command.arg("--remote").arg(addr);
        }

        let output = command.stdin(Stdio::null()).output().await?;
        let envelope: dh_types::Envelope<dh_types::vsock_proto::AugmentedExecReply> =
            serde_json::from_slice(&output.stdout)?;
        match envelope.data {
            Some(augmented) => Ok(augmented.reply),
            None => {
                let message = envelope
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "dh exec failed with no error body".to_string());
                anyhow::bail!(message)
            }
        }
    }

    fn engine_version(&self) -> &str {
        &self.version
    }

    fn mode_name(&self) -> &str {
        if self.vm {
            "vm"
        } else if self.remote.is_some() {
            "remote"
        } else {
            "cli"
        }
    }
}
