//! The microVM monitor (Firecracker) control surface: boot config, pause,
//! snapshot-create, load-snapshot, resume, destroy — all driven over the
//! monitor's HTTP-over-UDS API. Grounded in the teacher's
//! `core::uds_proxy::forward` (hyperlocal + hyper-util
//! `Client<UnixConnector>`), generalized from the teacher's fixed
//! snapshot/load/stop endpoints into the fuller verb set this spec needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use dh_types::DhError;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Abstracts the monitor so snapshot/restore orchestration is testable
/// without a real Firecracker binary and KVM access.
#[async_trait::async_trait]
pub trait Monitor: Send + Sync {
    async fn spawn(&self, api_sock: &Path) -> Result<u32, DhError>;
    async fn configure_boot(&self, api_sock: &Path, req: &BootConfig) -> Result<(), DhError>;
    /// Re-points the vsock device at a fresh per-instance UDS base before a
    /// snapshot restore, so that guest connections on ports 10000/10001 get
    /// forwarded to `<uds_path>_10000`/`<uds_path>_10001` under this
    /// instance's own run directory rather than the one used when the
    /// snapshot was created.
    async fn configure_vsock(&self, api_sock: &Path, uds_path: &Path, guest_cid: u32) -> Result<(), DhError>;
    async fn pause(&self, api_sock: &Path) -> Result<(), DhError>;
    async fn resume(&self, api_sock: &Path) -> Result<(), DhError>;
    async fn create_snapshot(
        &self,
        api_sock: &Path,
        mem_path: &Path,
        state_path: &Path,
    ) -> Result<(), DhError>;
    async fn load_snapshot(
        &self,
        api_sock: &Path,
        mem_path: &Path,
        state_path: &Path,
        uffd_sock: Option<&Path>,
    ) -> Result<(), DhError>;
    async fn destroy(&self, pid: u32, api_sock: &Path) -> Result<(), DhError>;
}

#[derive(Debug, Clone)]
pub struct BootConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub vsock_uds: PathBuf,
    pub vsock_guest_cid: u32,
}

pub struct FirecrackerMonitor {
    pub binary: PathBuf,
}

#[async_trait::async_trait]
impl Monitor for FirecrackerMonitor {
    async fn spawn(&self, api_sock: &Path) -> Result<u32, DhError> {
        if api_sock.exists() {
            let _ = tokio::fs::remove_file(api_sock).await;
        }
        if let Some(parent) = api_sock.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DhError::prereq_not_met(e.to_string()))?;
        }
        let child = tokio::process::Command::new(&self.binary)
            .arg("--api-sock")
            .arg(api_sock)
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| DhError::prereq_not_met(format!("failed to spawn monitor: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| DhError::prereq_not_met("monitor exited immediately"))?;

        wait_for_socket(api_sock, Duration::from_secs(2)).await?;
        Ok(pid)
    }

    async fn configure_boot(&self, api_sock: &Path, req: &BootConfig) -> Result<(), DhError> {
        put_json(
            api_sock,
            "/boot-source",
            serde_json::json!({ "kernel_image_path": req.kernel_path }),
        )
        .await?;
        put_json(
            api_sock,
            "/drives/rootfs",
            serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": req.rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;
        put_json(
            api_sock,
            "/vsock",
            serde_json::json!({
                "guest_cid": req.vsock_guest_cid,
                "uds_path": req.vsock_uds,
                "vsock_id": "vsock0",
            }),
        )
        .await?;
        put_json(
            api_sock,
            "/machine-config",
            serde_json::json!({ "vcpu_count": req.vcpu_count, "mem_size_mib": req.mem_size_mib }),
        )
        .await?;
        put_json(
            api_sock,
            "/actions",
            serde_json::json!({ "action_type": "InstanceStart" }),
        )
        .await
    }

    async fn configure_vsock(&self, api_sock: &Path, uds_path: &Path, guest_cid: u32) -> Result<(), DhError> {
        put_json(
            api_sock,
            "/vsock",
            serde_json::json!({
                "guest_cid": guest_cid,
                "uds_path": uds_path,
                "vsock_id": "vsock0",
            }),
        )
        .await
    }

    async fn pause(&self, api_sock: &Path) -> Result<(), DhError> {
        patch_json(api_sock, "/vm", serde_json::json!({ "state": "Paused" })).await
    }

    async fn resume(&self, api_sock: &Path) -> Result<(), DhError> {
        patch_json(api_sock, "/vm", serde_json::json!({ "state": "Resumed" })).await
    }

    async fn create_snapshot(
        &self,
        api_sock: &Path,
        mem_path: &Path,
        state_path: &Path,
    ) -> Result<(), DhError> {
        put_json(
            api_sock,
            "/snapshot/create",
            serde_json::json!({
                "mem_file_path": mem_path,
                "snapshot_path": state_path,
                "snapshot_type": "Full",
            }),
        )
        .await
    }

    async fn load_snapshot(
        &self,
        api_sock: &Path,
        mem_path: &Path,
        state_path: &Path,
        uffd_sock: Option<&Path>,
    ) -> Result<(), DhError> {
        let mut body = serde_json::json!({
            "snapshot_path": state_path,
            "enable_diff_snapshots": false,
            "resume_vm": true,
        });
        if let Some(uffd) = uffd_sock {
            body["mem_backend"] = serde_json::json!({
                "backend_type": "Uffd",
                "backend_path": uffd,
            });
        } else {
            body["mem_file_path"] = serde_json::json!(mem_path);
        }
        put_json(api_sock, "/snapshot/load", body).await
    }

    async fn destroy(&self, pid: u32, _api_sock: &Path) -> Result<(), DhError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        Ok(())
    }
}

async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), DhError> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Err(DhError::prereq_not_met(format!(
        "monitor API socket {} never became connectable",
        path.display()
    )))
}

async fn put_json(sock: &Path, uri_path: &str, body: serde_json::Value) -> Result<(), DhError> {
    request(sock, Method::PUT, uri_path, body).await
}

async fn patch_json(sock: &Path, uri_path: &str, body: serde_json::Value) -> Result<(), DhError> {
    request(sock, Method::PATCH, uri_path, body).await
}

async fn request(
    sock: &Path,
    method: Method,
    uri_path: &str,
    body: serde_json::Value,
) -> Result<(), DhError> {
    let client: Client<hyperlocal::UnixConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(hyperlocal::UnixConnector);
    let uri = hyperlocal::Uri::new(sock, uri_path);
    let payload = serde_json::to_vec(&body).map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    let resp = client
        .request(req)
        .await
        .map_err(|e| DhError::prereq_not_met(format!("monitor API request failed: {e}")))?;
    let status = resp.status();
    let body_bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?
        .to_bytes();
    if !status.is_success() {
        return Err(DhError::prereq_not_met(format!(
            "monitor API {uri_path} returned {status}: {}",
            String::from_utf8_lossy(&body_bytes)
        )));
    }
    Ok(())
}
