//! Host-side REPL session lifecycle (§4.4.2): spawns the runner in its
//! own process group, dispatches the reader loop between a keyed
//! reply-slot map and a bounded push channel (§9's recommended strategy
//! for the mixed request/response + server-push protocol), and drives
//! graceful shutdown.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dh_types::repl_proto::{Command, Reply};
use dh_types::DhError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};

const READY_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const TABLE_UPDATE_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Reply>>>;

/// Owns the runner subprocess and its stdin write lock. The reader loop
/// that dispatches replies runs as a detached task for the session's
/// lifetime.
pub struct ReplSession {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Arc<PendingMap>,
    exited: tokio::sync::watch::Receiver<bool>,
    pub table_updates: Mutex<mpsc::Receiver<dh_types::repl_proto::Reply>>,
    reader_task: tokio::task::JoinHandle<()>,
}

pub struct ReplSessionConfig {
    pub runner_bin: std::path::PathBuf,
    pub args: Vec<String>,
}

impl ReplSession {
    /// Spawns the runner, places it in its own process group, discards
    /// its stderr, and blocks up to 60 s for a `ready` message.
    pub async fn start(cfg: ReplSessionConfig) -> Result<Self, DhError> {
        let mut command = tokio::process::Command::new(&cfg.runner_bin);
        command
            .args(&cfg.args)
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

        let mut child = command.spawn().map_err(|e| {
            DhError::runner_startup_timeout(format!("failed to spawn REPL runner: {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DhError::runner_startup_timeout("runner has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DhError::runner_startup_timeout("runner has no stdout"))?;

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let (update_tx, update_rx) = mpsc::channel(TABLE_UPDATE_CHANNEL_CAPACITY);
        let (exited_tx, exited_rx) = tokio::sync::watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let reader_task = tokio::spawn(reader_loop(
            BufReader::new(stdout),
            Arc::clone(&pending),
            update_tx,
            exited_tx,
            ready_tx,
        ));

        let ready = tokio::time::timeout(READY_TIMEOUT, ready_rx).await;
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                kill_process_group(&mut child);
                reader_task.abort();
                return Err(DhError::runner_startup_timeout(
                    "REPL runner did not signal ready within 60s",
                ));
            }
        }

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            exited: exited_rx,
            table_updates: Mutex::new(update_rx),
            reader_task,
        })
    }

    /// Registers a reply slot keyed by the command's id, writes the JSON
    /// line under the stdin write-mutex, then blocks on either the reply
    /// or the runner having exited.
    pub async fn send_and_wait(&self, command: Command) -> Result<Reply, DhError> {
        let id = command.id().to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let mut line = serde_json::to_string(&command)
            .map_err(|e| DhError::config_error(format!("cannot encode command: {e}")))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            if stdin.write_all(line.as_bytes()).await.is_err() {
                self.pending.lock().await.remove(&id);
                return Err(DhError::runner_exited("write to REPL runner failed"));
            }
            let _ = stdin.flush().await;
        }

        let mut exited = self.exited.clone();
        tokio::select! {
            reply = rx => reply.map_err(|_| DhError::runner_exited("REPL runner closed before replying")),
            _ = exited.wait_for(|v| *v) => {
                self.pending.lock().await.remove(&id);
                Err(DhError::runner_exited("REPL runner exited mid-request"))
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Sends `shutdown`, closes stdin, waits up to 3s for clean exit, then
    /// kills the process group.
    pub async fn shutdown(self) {
        let shutdown_cmd = Command::Shutdown {
            id: uuid::Uuid::new_v4().to_string(),
        };
        if let Ok(line) = serde_json::to_string(&shutdown_cmd) {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.write_all(format!("{line}\n").as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
        drop(self.stdin);

        let mut child = self.child.lock().await;
        let waited = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
        if waited.is_err() {
            kill_process_group(&mut child);
        }
        self.reader_task.abort();
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.start_kill();
}

async fn reader_loop(
    mut stdout: BufReader<tokio::process::ChildStdout>,
    pending: Arc<PendingMap>,
    update_tx: mpsc::Sender<Reply>,
    exited_tx: tokio::sync::watch::Sender<bool>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut line = String::new();
    loop {
        line.clear();
        match stdout.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(reply) = serde_json::from_str::<Reply>(trimmed) else {
            continue;
        };

        match &reply {
            Reply::Ready => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            Reply::ShutdownAck => {}
            Reply::TableUpdate { .. } => {
                // Bounded, non-blocking: drops are safe because the
                // runner resends current viewport state every poll.
                let _ = update_tx.try_send(reply);
            }
            other => {
                if let Some(id) = other.id() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(reply);
                    }
                    // Unknown ids are dropped.
                }
            }
        }
    }

    let _ = exited_tx.send(true);
}
