//! Host TUI <-> Python-style runner subprocess protocol (§4.4.1, §6.7).
//! Newline-delimited JSON; one object per line. Host->runner messages carry
//! an `id`; runner->host replies echo it except for the three unsolicited
//! message types (`ready`, `table_update`, `shutdown_ack`).

use serde::{Deserialize, Serialize};

use crate::vsock_proto::{ColumnMeta, TablePreview};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Execute { id: String, code: String },
    ListTables { id: String },
    FetchTable { id: String, name: String, offset: u64, limit: u64 },
    ServerInfo { id: String },
    Subscribe { id: String, name: String, offset: u64, limit: u64 },
    Unsubscribe { id: String, name: String },
    Shutdown { id: String },
}

impl Command {
    pub fn id(&self) -> &str {
        match self {
            Command::Execute { id, .. }
            | Command::ListTables { id }
            | Command::FetchTable { id, .. }
            | Command::ServerInfo { id }
            | Command::Subscribe { id, .. }
            | Command::Unsubscribe { id, .. }
            | Command::Shutdown { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub row_count: u64,
    pub is_refreshing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableWindow {
    pub name: String,
    pub offset: u64,
    pub rows: Vec<Vec<String>>,
    pub total_rows: u64,
    pub columns: Vec<ColumnMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub engine_version: String,
    pub mode: String,
    pub connected: bool,
}

/// Runner -> host. `id` is present on request/response replies and absent
/// (serialized as `null` then skipped on the receive side) on the three
/// unsolicited message types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ready,
    Result {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result_repr: Option<String>,
        stdout: String,
        stderr: String,
        #[serde(default)]
        new_tables: Vec<String>,
    },
    Tables {
        id: String,
        tables: Vec<TableSummary>,
    },
    TableData {
        id: String,
        window: TableWindow,
    },
    ServerInfoReply {
        id: String,
        info: ServerInfo,
    },
    Error {
        id: String,
        message: String,
    },
    TableUpdate {
        table: TablePreview,
        window: TableWindow,
    },
    ShutdownAck,
}

impl Reply {
    /// The id this reply satisfies, if any. The two unsolicited types
    /// (`table_update`, `shutdown_ack`) and `ready` carry no id and must
    /// never be matched against a pending reply slot.
    pub fn id(&self) -> Option<&str> {
        match self {
            Reply::Result { id, .. }
            | Reply::Tables { id, .. }
            | Reply::TableData { id, .. }
            | Reply::ServerInfoReply { id, .. }
            | Reply::Error { id, .. } => Some(id),
            Reply::Ready | Reply::TableUpdate { .. } | Reply::ShutdownAck => None,
        }
    }
}
