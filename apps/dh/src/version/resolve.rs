//! `ResolveVersion` (§4.6): flag -> env -> nearest `.dhrc` -> config
//! default -> newest installed -> failure. Mirrors the teacher's
//! precedence-chain style used elsewhere in the spec (e.g. Java detection),
//! implemented here as a single ordered list of `Option<String>` producers.

use dh_types::{DhError, EngineVersion};

use crate::config::{find_dhrc_version, Config};
use crate::version::install::list_installed;
use crate::Paths;

pub struct ResolveInputs<'a> {
    pub flag_version: Option<&'a str>,
    pub env_version: Option<String>,
    pub cwd: std::path::PathBuf,
}

pub fn resolve_version(paths: &Paths, inputs: ResolveInputs) -> Result<EngineVersion, DhError> {
    if let Some(v) = inputs.flag_version {
        if !v.is_empty() {
            return Ok(EngineVersion::new(v));
        }
    }

    if let Some(v) = inputs.env_version {
        if !v.is_empty() {
            return Ok(EngineVersion::new(v));
        }
    }

    if let Some(v) = find_dhrc_version(&inputs.cwd) {
        if !v.is_empty() {
            return Ok(EngineVersion::new(v));
        }
    }

    let config = Config::load(paths)?;
    if let Some(v) = config.default_version {
        if !v.is_empty() {
            return Ok(EngineVersion::new(v));
        }
    }

    let installed = list_installed(paths)?;
    if let Some(newest) = installed.into_iter().next() {
        return Ok(newest.version);
    }

    Err(DhError::new(
        dh_types::ErrorKind::VersionNotFound,
        "no version configured: install one with `dh install` or pass --version",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VersionMeta;

    fn touch_version(paths: &Paths, v: &str) {
        let dir = paths.version_dir(&EngineVersion::new(v));
        std::fs::create_dir_all(&dir).unwrap();
        let meta = VersionMeta {
            installed_at: chrono::Utc::now(),
        };
        std::fs::write(paths.version_meta(&EngineVersion::new(v)), toml::to_string(&meta).unwrap()).unwrap();
    }

    /// E1: full precedence chain, each layer removed in turn.
    #[test]
    fn precedence_chain_e1() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().join("home"),
        };
        touch_version(&paths, "41.1");
        touch_version(&paths, "0.37.0");

        let mut config = Config::default();
        config.default_version = Some("0.37.0".to_string());
        config.save(&paths).unwrap();

        let cwd = tmp.path().join("proj");
        std::fs::create_dir_all(&cwd).unwrap();
        std::fs::write(cwd.join(".dhrc"), "version = \"41.1\"\n").unwrap();

        let resolved = resolve_version(
            &paths,
            ResolveInputs {
                flag_version: Some("0.35.1"),
                env_version: Some("0.36.0".to_string()),
                cwd: cwd.clone(),
            },
        )
        .unwrap();
        assert_eq!(resolved.as_str(), "0.35.1");

        let resolved = resolve_version(
            &paths,
            ResolveInputs {
                flag_version: None,
                env_version: Some("0.36.0".to_string()),
                cwd: cwd.clone(),
            },
        )
        .unwrap();
        assert_eq!(resolved.as_str(), "0.36.0");

        let resolved = resolve_version(
            &paths,
            ResolveInputs {
                flag_version: None,
                env_version: None,
                cwd: cwd.clone(),
            },
        )
        .unwrap();
        assert_eq!(resolved.as_str(), "41.1");

        std::fs::remove_file(cwd.join(".dhrc")).unwrap();
        let resolved = resolve_version(
            &paths,
            ResolveInputs {
                flag_version: None,
                env_version: None,
                cwd: cwd.clone(),
            },
        )
        .unwrap();
        assert_eq!(resolved.as_str(), "0.37.0");

        let mut config = Config::load(&paths).unwrap();
        config.default_version = None;
        config.save(&paths).unwrap();
        let resolved = resolve_version(
            &paths,
            ResolveInputs {
                flag_version: None,
                env_version: None,
                cwd,
            },
        )
        .unwrap();
        assert_eq!(resolved.as_str(), "41.1");
    }

    #[test]
    fn no_version_configured_is_distinct_error() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            root: tmp.path().to_path_buf(),
        };
        let err = resolve_version(
            &paths,
            ResolveInputs {
                flag_version: None,
                env_version: None,
                cwd: tmp.path().to_path_buf(),
            },
        )
        .unwrap_err();
        assert_eq!(err.kind.as_str(), "version-not-found");
    }
}
