//! Artifact root layout (§3.1) and config file handling (§6.3).
//!
//! Centralizes every path under the artifact root the way the teacher's
//! `AppState { run_dir, bridge }` centralizes the agent's one shared path,
//! generalized here to the full tree the spec requires.

use std::path::{Path, PathBuf};

use dh_types::{DhError, EngineVersion};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
}

impl Paths {
    pub fn resolve(config_dir_flag: Option<&str>) -> Self {
        let root = config_dir_flag
            .map(PathBuf::from)
            .or_else(|| std::env::var("DH_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
                PathBuf::from(home).join(".dh")
            });
        Self { root }
    }

    pub fn config_toml(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    pub fn version_dir(&self, v: &EngineVersion) -> PathBuf {
        self.versions_dir().join(v.as_str())
    }

    pub fn version_venv(&self, v: &EngineVersion) -> PathBuf {
        self.version_dir(v).join(".venv")
    }

    pub fn version_meta(&self, v: &EngineVersion) -> PathBuf {
        self.version_dir(v).join("meta.toml")
    }

    pub fn java_dir(&self) -> PathBuf {
        self.root.join("java")
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.root.join("vm")
    }

    pub fn vm_firecracker_bin(&self) -> PathBuf {
        self.vm_dir().join("firecracker")
    }

    pub fn vm_kernel(&self) -> PathBuf {
        self.vm_dir().join("vmlinux")
    }

    pub fn vm_rootfs(&self, v: &EngineVersion) -> PathBuf {
        self.vm_dir()
            .join("rootfs")
            .join(format!("deephaven-{v}.ext4"))
    }

    pub fn vm_snapshots_dir(&self, v: &EngineVersion) -> PathBuf {
        self.vm_dir().join("snapshots").join(v.as_str())
    }

    pub fn vm_run_dir(&self) -> PathBuf {
        self.vm_dir().join("run")
    }

    pub fn vm_instance_dir(&self, instance_id: &str) -> PathBuf {
        self.vm_run_dir().join(instance_id)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn pool_pid(&self) -> PathBuf {
        self.root.join("pool.pid")
    }

    pub fn pool_json(&self) -> PathBuf {
        self.root.join("pool.json")
    }

    pub fn pool_log(&self) -> PathBuf {
        self.root.join("pool.log")
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("history")
    }
}

/// `<root>/config.toml` (§6.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default_version: Option<String>,
    #[serde(default)]
    pub install: InstallConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub python_version: Option<String>,
}

impl Config {
    /// A missing config.toml is treated as all-defaults; a malformed one is
    /// a `config-error`.
    pub fn load(paths: &Paths) -> Result<Self, DhError> {
        let path = paths.config_toml();
        match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|e| {
                DhError::config_error(format!("malformed config at {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(DhError::config_error(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn save(&self, paths: &Paths) -> Result<(), DhError> {
        let path = paths.config_toml();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DhError::permission_denied(e.to_string()))?;
        }
        let text =
            toml::to_string_pretty(self).map_err(|e| DhError::config_error(e.to_string()))?;
        std::fs::write(&path, text).map_err(|e| DhError::permission_denied(e.to_string()))
    }
}

/// `meta.toml` written into `versions/<V>/` on install (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMeta {
    pub installed_at: chrono::DateTime<chrono::Utc>,
}

/// Finds the nearest `.dhrc` file walking up from `start` to the
/// filesystem root, returning its parsed `version` field if present
/// (§4.6 step 3, §6.3).
pub fn find_dhrc_version(start: &Path) -> Option<String> {
    let mut dir = Some(start.to_path_buf());
    while let Some(d) = dir {
        let candidate = d.join(".dhrc");
        if let Ok(text) = std::fs::read_to_string(&candidate) {
            if let Some(v) = parse_dhrc(&text) {
                return Some(v);
            }
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    None
}

fn parse_dhrc(text: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Dhrc {
        version: String,
    }
    toml::from_str::<Dhrc>(text).ok().map(|d| d.version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let cfg = Config::load(&paths).unwrap();
        assert!(cfg.default_version.is_none());
    }

    #[test]
    fn malformed_config_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        std::fs::write(paths.config_toml(), "not = [valid").unwrap();
        let err = Config::load(&paths).unwrap_err();
        assert_eq!(err.kind.as_str(), "config-error");
    }

    #[test]
    fn dhrc_found_walking_up() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join(".dhrc"), "version = \"41.1\"\n").unwrap();
        assert_eq!(find_dhrc_version(&nested), Some("41.1".to_string()));
    }

    #[test]
    fn dhrc_nearest_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join(".dhrc"), "version = \"0.1.0\"\n").unwrap();
        std::fs::write(nested.join(".dhrc"), "version = \"41.1\"\n").unwrap();
        assert_eq!(find_dhrc_version(&nested), Some("41.1".to_string()));
    }
}
