use std::fmt;

/// The error taxonomy from the error-handling design: the kinds surfaced
/// to users, each with a fixed exit code and a disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    VersionNotFound,
    VersionNotInstalled,
    JavaNotFound,
    EnvToolNotFound,
    InstallFailed,
    NetworkError,
    PermissionDenied,
    ConfigError,
    PrereqNotMet,
    SnapshotNotReady,
    RunnerStartupTimeout,
    RunnerExited,
    ScriptError,
    Timeout,
    Interrupted,
}

impl ErrorKind {
    /// The slug used in JSON error bodies and in `--json` mode, e.g.
    /// `"version-not-found"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::VersionNotFound => "version-not-found",
            ErrorKind::VersionNotInstalled => "version-not-installed",
            ErrorKind::JavaNotFound => "java-not-found",
            ErrorKind::EnvToolNotFound => "env-tool-not-found",
            ErrorKind::InstallFailed => "install-failed",
            ErrorKind::NetworkError => "network-error",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::ConfigError => "config-error",
            ErrorKind::PrereqNotMet => "prereq-not-met",
            ErrorKind::SnapshotNotReady => "snapshot-not-ready",
            ErrorKind::RunnerStartupTimeout => "runner-startup-timeout",
            ErrorKind::RunnerExited => "runner-exited",
            ErrorKind::ScriptError => "script-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Interrupted => "interrupted",
        }
    }

    /// The exit code mapping from §6.4 / §7.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::VersionNotFound | ErrorKind::VersionNotInstalled => 4,
            ErrorKind::JavaNotFound
            | ErrorKind::EnvToolNotFound
            | ErrorKind::NetworkError
            | ErrorKind::SnapshotNotReady
            | ErrorKind::RunnerStartupTimeout
            | ErrorKind::RunnerExited => 2,
            ErrorKind::InstallFailed
            | ErrorKind::PermissionDenied
            | ErrorKind::ConfigError
            | ErrorKind::ScriptError => 1,
            ErrorKind::PrereqNotMet => 2,
            ErrorKind::Timeout => 3,
            ErrorKind::Interrupted => 130,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The core error type, carrying a taxonomy kind plus a human message.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DhError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DhError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

macro_rules! kind_ctor {
    ($name:ident, $kind:ident) => {
        impl DhError {
            pub fn $name(message: impl Into<String>) -> Self {
                Self::new(ErrorKind::$kind, message)
            }
        }
    };
}

kind_ctor!(version_not_found, VersionNotFound);
kind_ctor!(version_not_installed, VersionNotInstalled);
kind_ctor!(java_not_found, JavaNotFound);
kind_ctor!(env_tool_not_found, EnvToolNotFound);
kind_ctor!(install_failed, InstallFailed);
kind_ctor!(network_error, NetworkError);
kind_ctor!(permission_denied, PermissionDenied);
kind_ctor!(config_error, ConfigError);
kind_ctor!(prereq_not_met, PrereqNotMet);
kind_ctor!(snapshot_not_ready, SnapshotNotReady);
kind_ctor!(runner_startup_timeout, RunnerStartupTimeout);
kind_ctor!(runner_exited, RunnerExited);
kind_ctor!(script_error, ScriptError);
kind_ctor!(timeout, Timeout);
kind_ctor!(interrupted, Interrupted);
