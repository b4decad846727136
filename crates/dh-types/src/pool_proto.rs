//! Client <-> warm-pool daemon protocol over `/tmp/dh-pool-<uid>.sock`
//! (§4.1.4, §6.8). One JSON request per connection, one JSON reply.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolExecRequest {
    pub code: String,
    pub cwd: String,
    #[serde(default)]
    pub show_tables: bool,
    #[serde(default)]
    pub show_table_meta: bool,
}

/// `pool.json`: the daemon's on-disk metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMeta {
    pub pid: u32,
    pub size: usize,
    pub idle_timeout_secs: Option<u64>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub version: String,
}
