//! The guest root filesystem image is built by an external container-image
//! tool (out of scope per SPEC_FULL §3 Non-goals: building the image
//! itself). `RootfsBuilder` is the capability-set boundary, matching the
//! `EnvBuilder`/`JdkFetcher` pattern used elsewhere for out-of-scope
//! collaborators.

use std::path::{Path, PathBuf};

use dh_types::{DhError, EngineVersion};

pub trait RootfsBuilder: Send + Sync {
    /// Builds (or returns an already-built) ext4 rootfs image for `version`
    /// at `dest`, containing the Deephaven engine, the bundled JRE, the
    /// guest runner binary, and `fsproxy.so` preloaded via `/etc/ld.so.preload`.
    fn build(&self, version: &EngineVersion, dest: &Path) -> Result<(), DhError>;
}

/// Shells out to an external image-building tool named on `PATH`
/// (`dh-rootfs-builder`), matching the `ExternalEnvBuilder` shell-out
/// pattern used for Python environment construction.
pub struct ExternalRootfsBuilder {
    pub builder_bin: PathBuf,
}

impl RootfsBuilder for ExternalRootfsBuilder {
    fn build(&self, version: &EngineVersion, dest: &Path) -> Result<(), DhError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DhError::permission_denied(e.to_string()))?;
        }
        let status = std::process::Command::new(&self.builder_bin)
            .arg("--engine-version")
            .arg(version.as_str())
            .arg("--output")
            .arg(dest)
            .status()
            .map_err(|e| {
                DhError::prereq_not_met(format!(
                    "{} not runnable: {e}",
                    self.builder_bin.display()
                ))
            })?;
        if !status.success() {
            return Err(DhError::install_failed(format!(
                "rootfs builder exited with {status}"
            )));
        }
        if !dest.exists() {
            return Err(DhError::install_failed(
                "rootfs builder reported success but produced no image",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBuilder {
        should_fail: bool,
    }

    impl RootfsBuilder for FakeBuilder {
        fn build(&self, _version: &EngineVersion, dest: &Path) -> Result<(), DhError> {
            if self.should_fail {
                return Err(DhError::install_failed("boom"));
            }
            std::fs::write(dest, b"fake-ext4")
                .map_err(|e| DhError::permission_denied(e.to_string()))
        }
    }

    #[test]
    fn fake_builder_writes_image() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("rootfs.ext4");
        let builder = FakeBuilder { should_fail: false };
        builder.build(&EngineVersion::new("41.1"), &dest).unwrap();
        assert!(dest.exists());
    }

    #[test]
    fn fake_builder_propagates_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("rootfs.ext4");
        let builder = FakeBuilder { should_fail: true };
        assert!(builder.build(&EngineVersion::new("41.1"), &dest).is_err());
    }
}
