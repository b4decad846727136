//! Install/uninstall/list for engine versions (§4.6).
//!
//! Delegates the actual Python environment build to an external,
//! process-external tool (kept out of the core per §1's "PyPI HTTP
//! fetching... out of scope" and the design notes' recommendation to treat
//! the env builder the same way). The orchestration, rollback-on-failure,
//! and default-version bookkeeping are fully implemented here.

use std::path::PathBuf;

use dh_types::{DhError, EngineVersion};

use crate::config::{Config, VersionMeta};
use crate::Paths;

pub struct InstalledVersion {
    pub version: EngineVersion,
    pub installed_at: chrono::DateTime<chrono::Utc>,
}

/// A process-external tool that builds an isolated Python environment for
/// a given engine version. Production code shells out to it; tests use a
/// fake.
pub trait EnvBuilder {
    fn build_venv(
        &self,
        venv_dir: &PathBuf,
        python_version: &str,
        engine_version: &EngineVersion,
        plugins: &[String],
    ) -> Result<(), DhError>;
}

pub struct ExternalEnvBuilder {
    pub binary: PathBuf,
}

impl EnvBuilder for ExternalEnvBuilder {
    fn build_venv(
        &self,
        venv_dir: &PathBuf,
        python_version: &str,
        engine_version: &EngineVersion,
        plugins: &[String],
    ) -> Result<(), DhError> {
        if !self.binary.exists() {
            return Err(DhError::env_tool_not_found(format!(
                "{} not found; install it first",
                self.binary.display()
            )));
        }
        let mut cmd = std::process::Command::new(&self.binary);
        cmd.arg("venv")
            .arg(venv_dir)
            .arg("--python")
            .arg(python_version);
        let status = cmd
            .status()
            .map_err(|e| DhError::install_failed(format!("failed to spawn env builder: {e}")))?;
        if !status.success() {
            return Err(DhError::install_failed("env builder exited non-zero"));
        }

        let pip = venv_dir.join("bin").join("pip");
        let mut packages = vec![
            format!("deephaven-server=={engine_version}"),
            format!("deephaven-plugin=={engine_version}"),
        ];
        packages.extend(plugins.iter().cloned());
        let status = std::process::Command::new(&pip)
            .arg("install")
            .args(&packages)
            .status()
            .map_err(|e| DhError::install_failed(format!("failed to spawn pip: {e}")))?;
        if !status.success() {
            return Err(DhError::install_failed("package install failed"));
        }
        Ok(())
    }
}

/// `Install(home, V, python_version, plugins, progress)` (§4.6).
pub fn install(
    paths: &Paths,
    builder: &dyn EnvBuilder,
    version: &EngineVersion,
    python_version: &str,
    plugins: &[String],
    mut progress: impl FnMut(&str),
) -> Result<(), DhError> {
    let dir = paths.version_dir(version);
    if dir.exists() {
        return Err(DhError::install_failed(format!(
            "version {version} already installed"
        )));
    }
    std::fs::create_dir_all(&dir).map_err(|e| DhError::permission_denied(e.to_string()))?;

    let result = (|| {
        progress(&format!("building isolated environment for {version}"));
        builder.build_venv(&paths.version_venv(version), python_version, version, plugins)?;

        let meta = VersionMeta {
            installed_at: chrono::Utc::now(),
        };
        let meta_text = toml::to_string_pretty(&meta).map_err(|e| DhError::install_failed(e.to_string()))?;
        std::fs::write(paths.version_meta(version), meta_text)
            .map_err(|e| DhError::permission_denied(e.to_string()))?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_dir_all(&dir);
        return Err(err);
    }

    // On first successful install, if no default is configured, set it.
    let mut config = Config::load(paths)?;
    if config.default_version.is_none() {
        config.default_version = Some(version.as_str().to_string());
        config.save(paths)?;
    }

    Ok(())
}

/// `Uninstall(home, V)` (§4.6). Clears the default if it pointed at V;
/// callers may then reset it to the newest remaining version.
pub fn uninstall(paths: &Paths, version: &EngineVersion) -> Result<(), DhError> {
    let dir = paths.version_dir(version);
    if !dir.exists() {
        return Err(DhError::version_not_installed(format!(
            "{version} is not installed"
        )));
    }
    std::fs::remove_dir_all(&dir).map_err(|e| DhError::permission_denied(e.to_string()))?;

    let mut config = Config::load(paths)?;
    if config.default_version.as_deref() == Some(version.as_str()) {
        config.default_version = None;
        config.save(paths)?;
    }
    Ok(())
}

/// `ListInstalled(home)` (§4.6): enumerate `versions/`, read each
/// `meta.toml`, sort descending by semver.
pub fn list_installed(paths: &Paths) -> Result<Vec<InstalledVersion>, DhError> {
    let versions_dir = paths.versions_dir();
    let entries = match std::fs::read_dir(&versions_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DhError::permission_denied(e.to_string())),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DhError::permission_denied(e.to_string()))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let version = EngineVersion::new(name.clone());
        let meta_path = paths.version_meta(&version);
        let installed_at = match std::fs::read_to_string(&meta_path) {
            Ok(text) => toml::from_str::<VersionMeta>(&text)
                .map(|m| m.installed_at)
                .unwrap_or_else(|_| chrono::Utc::now()),
            Err(_) => continue, // meta.toml absent: install never completed; not a listed version
        };
        out.push(InstalledVersion {
            version,
            installed_at,
        });
    }
    out.sort_by(|a, b| b.version.cmp(&a.version));
    Ok(out)
}

pub fn default_version(paths: &Paths) -> Result<Option<EngineVersion>, DhError> {
    Ok(Config::load(paths)?.default_version.map(EngineVersion::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBuilder {
        should_fail: bool,
    }

    impl EnvBuilder for FakeBuilder {
        fn build_venv(
            &self,
            venv_dir: &PathBuf,
            _python_version: &str,
            _engine_version: &EngineVersion,
            _plugins: &[String],
        ) -> Result<(), DhError> {
            if self.should_fail {
                return Err(DhError::install_failed("boom"));
            }
            std::fs::create_dir_all(venv_dir).unwrap();
            Ok(())
        }
    }

    /// Testable Property 1: failed install leaves no `versions/V/` behind.
    #[test]
    fn failed_install_removes_version_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let builder = FakeBuilder { should_fail: true };
        let version = EngineVersion::new("41.1");
        let err = install(&paths, &builder, &version, "3.13", &[], |_| {}).unwrap_err();
        assert_eq!(err.kind.as_str(), "install-failed");
        assert!(!paths.version_dir(&version).exists());
    }

    #[test]
    fn successful_install_sets_default_once() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let builder = FakeBuilder { should_fail: false };
        let v1 = EngineVersion::new("41.1");
        install(&paths, &builder, &v1, "3.13", &[], |_| {}).unwrap();
        assert_eq!(default_version(&paths).unwrap(), Some(v1.clone()));

        let v2 = EngineVersion::new("41.2");
        install(&paths, &builder, &v2, "3.13", &[], |_| {}).unwrap();
        // default unchanged on second install
        assert_eq!(default_version(&paths).unwrap(), Some(v1));
    }

    #[test]
    fn uninstall_clears_default_when_it_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let builder = FakeBuilder { should_fail: false };
        let v1 = EngineVersion::new("41.1");
        install(&paths, &builder, &v1, "3.13", &[], |_| {}).unwrap();
        uninstall(&paths, &v1).unwrap();
        assert_eq!(default_version(&paths).unwrap(), None);
        assert!(!paths.version_dir(&v1).exists());
    }

    #[test]
    fn uninstall_missing_version_is_not_installed_error() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let err = uninstall(&paths, &EngineVersion::new("99.0")).unwrap_err();
        assert_eq!(err.kind.as_str(), "version-not-installed");
    }

    #[test]
    fn list_installed_sorts_descending_by_semver() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let builder = FakeBuilder { should_fail: false };
        for v in ["0.37.0", "41.1", "2.0.0"] {
            install(&paths, &builder, &EngineVersion::new(v), "3.13", &[], |_| {}).unwrap();
        }
        let list = list_installed(&paths).unwrap();
        let versions: Vec<&str> = list.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(versions, vec!["41.1", "2.0.0", "0.37.0"]);
    }
}
