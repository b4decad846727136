//! Host <-> in-VM runner wire shapes over vsock port 10000 (§6.5), plus the
//! host-side rendering shape from §4.1.5. One JSON object per line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub code: String,
    #[serde(default)]
    pub show_tables: bool,
    #[serde(default)]
    pub show_table_meta: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, String>>,
}

/// The exit code vocabulary from §4.1.5: 0 success, 1 script error,
/// 2 connection error, 130 interrupted.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const SCRIPT_ERROR: i32 = 1;
    pub const CONNECTION_ERROR: i32 = 2;
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePreview {
    pub name: String,
    pub row_count: u64,
    pub is_refreshing: bool,
    pub columns: Vec<ColumnMeta>,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReply {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_repr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tables: Vec<TablePreview>,
}

impl ExecReply {
    pub fn success(stdout: String, stderr: String, result_repr: Option<String>) -> Self {
        Self {
            exit_code: exit_code::SUCCESS,
            stdout,
            stderr,
            result_repr,
            error: None,
            tables: Vec::new(),
        }
    }

    pub fn script_error(stdout: String, stderr: String, traceback: String) -> Self {
        Self {
            exit_code: exit_code::SCRIPT_ERROR,
            stdout,
            stderr,
            result_repr: None,
            error: Some(traceback),
            tables: Vec::new(),
        }
    }
}

/// The host-side augmented reply wrapped for `--json` output (§4.1.5):
/// "Go/host-side augmentation (resolved version, Java path, elapsed
/// seconds) into a single stdout JSON object".
#[derive(Debug, Serialize, Deserialize)]
pub struct AugmentedExecReply {
    #[serde(flatten)]
    pub reply: ExecReply,
    pub resolved_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub java_path: Option<String>,
    pub elapsed_seconds: f64,
}
