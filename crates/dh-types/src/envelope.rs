use serde::{Deserialize, Serialize};

use crate::error::{DhError, ErrorKind};

/// The single JSON object every command emits on stdout in `--json` mode
/// (§6.2). Human mode renders the same data through a different path but
/// never constructs a second, divergent shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub exit_code: i32,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(err: &DhError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: err.kind.as_str().to_string(),
                message: err.message.clone(),
                exit_code: err.exit_code(),
            }),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match &self.error {
            Some(e) => e.exit_code,
            None => 0,
        }
    }
}

/// A single progress line emitted on stderr in `--json` mode (§6.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressLine {
    pub level: ProgressLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl ErrorKind {
    /// Convenience used by CLI glue that only has the taxonomy kind, not a
    /// full `DhError`, e.g. when mapping a child process's exit status.
    pub fn into_error_body(self, message: impl Into<String>) -> ErrorBody {
        ErrorBody {
            kind: self.as_str().to_string(),
            message: message.into(),
            exit_code: self.exit_code(),
        }
    }
}
