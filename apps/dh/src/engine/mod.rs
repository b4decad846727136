//! The execution-engine capability set (§9 Design Notes: "define a small
//! capability set... and provide two implementations behind that
//! interface"). `exec`/`serve`/`repl` branch on mode (embedded, remote,
//! microVM) but all three drive the same request/reply shape; the VM path
//! goes through `crate::vm` instead of this trait since it has its own
//! lifecycle (snapshot, instance, teardown).

pub mod embedded;
pub mod remote;

use async_trait::async_trait;
use dh_types::repl_proto::TableSummary;
use dh_types::vsock_proto::{ExecReply, ExecRequest};
use dh_types::DhError;

pub use embedded::EmbeddedEngine;
pub use remote::RemoteEngine;

/// Shared by the embedded runner, the remote client, and the in-VM runner
/// (the latter lives in `apps/dh-vm-runner` against the same shape).
#[async_trait]
pub trait Engine: Send + Sync {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecReply, DhError>;
    async fn list_tables(&self) -> Result<Vec<TableSummary>, DhError>;
}
