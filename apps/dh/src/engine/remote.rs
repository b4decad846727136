//! Remote mode: connects to a pre-existing engine server over the
//! engine's own RPC (its gRPC protocol and Arrow serialization are out of
//! scope per §1 Non-goals). `RemoteEngine` only owns addressing and the
//! `Engine` trait surface; actual wire calls are delegated to an external
//! client binary, the same "shell out to an external collaborator"
//! pattern used by `EnvBuilder` and `JdkFetcher`.

use async_trait::async_trait;
use dh_types::repl_proto::TableSummary;
use dh_types::vsock_proto::{ExecReply, ExecRequest};
use dh_types::DhError;

use super::Engine;

pub struct RemoteEngine {
    pub host: String,
    pub port: u16,
    pub client_bin: std::path::PathBuf,
}

impl RemoteEngine {
    pub fn new(host: impl Into<String>, port: u16, client_bin: std::path::PathBuf) -> Self {
        Self {
            host: host.into(),
            port,
            client_bin,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Engine for RemoteEngine {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecReply, DhError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| DhError::config_error(format!("cannot encode request: {e}")))?;

        let output = tokio::process::Command::new(&self.client_bin)
            .arg("exec")
            .arg("--address")
            .arg(self.address())
            .arg("--request")
            .arg(&payload)
            .output()
            .await
            .map_err(|e| {
                DhError::network_error(format!(
                    "remote engine client {} not runnable: {e}",
                    self.client_bin.display()
                ))
            })?;

        if !output.status.success() {
            return Err(DhError::network_error(format!(
                "remote engine at {} returned {}: {}",
                self.address(),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| DhError::network_error(format!("malformed reply from remote engine: {e}")))
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
