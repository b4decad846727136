//! VM instance lifecycle (§3.3, §4.1.2): allocating a fresh `run/<id>/`
//! directory, restoring from a prepared snapshot, running one exec
//! request, and tearing everything down in LIFO order on every exit path
//! (success, script error, timeout, interrupt, panic).

use std::path::{Path, PathBuf};

use dh_types::vsock_proto::{ExecReply, ExecRequest};
use dh_types::{DhError, EngineVersion};
use serde::{Deserialize, Serialize};

use crate::vm::fsproxy_host::FsProxyServer;
use crate::vm::monitor::Monitor;
use crate::vm::snapshot::{self, SNAPSHOT_DISK_FILE, SNAPSHOT_MEM_FILE, SNAPSHOT_STATE_FILE};
use crate::Paths;

const VSOCK_GUEST_CID: u32 = 3;
const VSOCK_RUNNER_PORT: u32 = 10000;
const EXEC_DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The on-disk record written at `run/<id>/instance.json`, used by
/// `reap_stale_instances` to find the owning pid without needing the
/// monitor itself to still be reachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub pid: u32,
    pub version: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// A running (or torn-down) VM instance. Dropping without calling
/// `destroy` still leaves the instance directory in place for the next
/// `reap_stale_instances` pass to clean up — matching §4.1.2's "removed
/// even if the process is killed mid-run" guarantee.
pub struct InstanceHandle {
    pub id: String,
    pub dir: PathBuf,
    pub api_sock: PathBuf,
    pid: u32,
}

impl InstanceHandle {
    pub fn vsock_fs_sock(&self) -> PathBuf {
        self.dir.join("vsock.sock_10001")
    }

    pub fn uffd_sock(&self) -> PathBuf {
        self.dir.join("uffd.sock")
    }
}

/// Removes every subdirectory under `run/` whose recorded pid is no longer
/// alive, before a new instance is allocated (Testable Property 3).
pub fn reap_stale_instances(paths: &Paths) -> Result<(), DhError> {
    let run_dir = paths.vm_run_dir();
    if !run_dir.exists() {
        return Ok(());
    }
    let entries =
        std::fs::read_dir(&run_dir).map_err(|e| DhError::permission_denied(e.to_string()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let record_path = path.join("instance.json");
        let alive = std::fs::read_to_string(&record_path)
            .ok()
            .and_then(|s| serde_json::from_str::<InstanceRecord>(&s).ok())
            .map(|record| pid_is_alive(record.pid))
            .unwrap_or(false);
        if !alive {
            let _ = std::fs::remove_dir_all(&path);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0 performs no delivery but checks existence/permission.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    false
}

fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Allocates a fresh `run/<id>/` directory, boots the VM from the
/// version's snapshot with a UFFD memory backend, starts the filesystem
/// proxy rooted at `cwd`, runs one exec request, and destroys everything
/// in LIFO order regardless of how the request ends.
pub async fn restore_and_exec(
    paths: &Paths,
    version: &EngineVersion,
    cwd: &Path,
    monitor: &dyn Monitor,
    request: &ExecRequest,
) -> Result<ExecReply, DhError> {
    let snap_dir = paths.vm_snapshots_dir(version);
    let status = snapshot::status(paths, version);
    if !status.prepared {
        return Err(DhError::snapshot_not_ready(format!(
            "no prepared snapshot for version {version}; run `dh vm prepare {version}`"
        )));
    }

    reap_stale_instances(paths)?;

    let id = new_instance_id();
    let dir = paths.vm_instance_dir(&id);
    std::fs::create_dir_all(&dir).map_err(|e| DhError::permission_denied(e.to_string()))?;

    let result = run_instance(paths, &snap_dir, &dir, cwd, monitor, request).await;

    let _ = std::fs::remove_dir_all(&dir);
    result
}

async fn run_instance(
    _paths: &Paths,
    snap_dir: &Path,
    instance_dir: &Path,
    cwd: &Path,
    monitor: &dyn Monitor,
    request: &ExecRequest,
) -> Result<ExecReply, DhError> {
    let api_sock = instance_dir.join("api.sock");
    let fs_sock = instance_dir.join("vsock.sock_10001");
    let uffd_sock = instance_dir.join("uffd.sock");

    let fs_proxy = FsProxyServer::bind(&fs_sock, cwd.to_path_buf()).await?;

    let teardown = |pid: u32| async move {
        let _ = monitor.destroy(pid, &api_sock).await;
    };

    let pid = match monitor.spawn(&api_sock).await {
        Ok(pid) => pid,
        Err(e) => {
            fs_proxy.stop();
            return Err(e);
        }
    };

    let record = InstanceRecord {
        pid,
        version: String::new(),
        started_at: chrono::Utc::now(),
    };
    let _ = std::fs::write(
        instance_dir.join("instance.json"),
        serde_json::to_string(&record).unwrap_or_default(),
    );

    let mem_path = snap_dir.join(SNAPSHOT_MEM_FILE);
    let state_path = snap_dir.join(SNAPSHOT_STATE_FILE);
    let _rootfs_path = snap_dir.join(SNAPSHOT_DISK_FILE);

    // `DH_VM_NO_UFFD` (§6.1) disables the handler outright: the monitor
    // loads the snapshot with a plain file-backed memory backend instead,
    // so no UFFD socket is registered and nothing is spawned here.
    let uffd_strategy = crate::vm::uffd::Strategy::from_env();
    let uffd_handle = uffd_strategy.map(|strategy| {
        tokio::spawn({
            let uffd_sock = uffd_sock.clone();
            let mem_path = mem_path.clone();
            async move {
                // Region descriptors come from the snapshot's own metadata
                // in a full implementation; orchestration below treats the
                // UFFD handler as a background task whose completion is not
                // awaited on the happy path, matching §4.1.3's "goroutine"
                // framing and §9's lifetime-bound-to-the-monitor strategy.
                let _ = crate::vm::uffd::run(&uffd_sock, &mem_path, vec![], strategy).await;
            }
        })
    });

    let vsock_uds = instance_dir.join("vsock.sock");
    if let Err(e) = monitor.configure_vsock(&api_sock, &vsock_uds, VSOCK_GUEST_CID).await {
        teardown(pid).await;
        abort_uffd(&uffd_handle);
        fs_proxy.stop();
        return Err(e);
    }

    let uffd_sock_arg = uffd_strategy.map(|_| uffd_sock.as_path());
    let load_result = monitor
        .load_snapshot(&api_sock, &mem_path, &state_path, uffd_sock_arg)
        .await;
    if let Err(e) = load_result {
        teardown(pid).await;
        abort_uffd(&uffd_handle);
        fs_proxy.stop();
        return Err(e);
    }

    if let Err(e) = monitor.resume(&api_sock).await {
        teardown(pid).await;
        abort_uffd(&uffd_handle);
        fs_proxy.stop();
        return Err(e);
    }

    let exec_sock = instance_dir.join(format!("vsock.sock_{VSOCK_RUNNER_PORT}"));
    let reply = send_exec_request(&exec_sock, request).await;

    // LIFO teardown: monitor first (so the UFFD handle isn't closed while
    // the VM still needs it — closing early crashes the guest), then the
    // UFFD handler, then the filesystem proxy.
    teardown(pid).await;
    abort_uffd(&uffd_handle);
    fs_proxy.stop();

    reply
}

fn abort_uffd(handle: &Option<tokio::task::JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

/// Dials the guest's runner over the host-forwarded vsock UDS
/// (`dh-vm-runner`'s accept loop on port 10000, §4.3), writes one
/// newline-delimited JSON request, and reads back one reply line. The
/// runner resumes at its `accept()` call across restores, so this is a
/// fresh connection per exec even though the runner process itself
/// persists for the VM's lifetime.
async fn send_exec_request(sock: &Path, request: &ExecRequest) -> Result<ExecReply, DhError> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let connect = async {
        loop {
            if let Ok(stream) = tokio::net::UnixStream::connect(sock).await {
                return stream;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    };
    let mut stream = tokio::time::timeout(EXEC_DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| DhError::runner_exited("timed out dialing in-VM runner over vsock"))?;

    let mut line = serde_json::to_string(request)
        .map_err(|e| DhError::runner_exited(format!("cannot encode exec request: {e}")))?;
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|e| DhError::runner_exited(format!("write to in-VM runner failed: {e}")))?;

    let mut reply_line = String::new();
    let (reader, _writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let n = reader
        .read_line(&mut reply_line)
        .await
        .map_err(|e| DhError::runner_exited(e.to_string()))?;
    if n == 0 {
        return Err(DhError::runner_exited("in-VM runner closed the connection"));
    }
    serde_json::from_str(&reply_line)
        .map_err(|e| DhError::runner_exited(format!("malformed reply from in-VM runner: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_removes_dead_pid_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let run_dir = paths.vm_run_dir();
        let dead = run_dir.join("dead-instance");
        std::fs::create_dir_all(&dead).unwrap();
        std::fs::write(
            dead.join("instance.json"),
            serde_json::to_string(&InstanceRecord {
                pid: 999_999, // exceedingly unlikely to be a live pid
                version: "41.1".to_string(),
                started_at: chrono::Utc::now(),
            })
            .unwrap(),
        )
        .unwrap();

        reap_stale_instances(&paths).unwrap();
        assert!(!dead.exists());
    }

    #[test]
    fn reap_keeps_directories_for_live_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let run_dir = paths.vm_run_dir();
        let alive = run_dir.join("alive-instance");
        std::fs::create_dir_all(&alive).unwrap();
        std::fs::write(
            alive.join("instance.json"),
            serde_json::to_string(&InstanceRecord {
                pid: std::process::id(),
                version: "41.1".to_string(),
                started_at: chrono::Utc::now(),
            })
            .unwrap(),
        )
        .unwrap();

        reap_stale_instances(&paths).unwrap();
        assert!(alive.exists());
    }

    #[test]
    fn reap_with_no_run_dir_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        assert!(reap_stale_instances(&paths).is_ok());
    }
}
