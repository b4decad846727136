//! `Install(home, jdk_version, force)` (§4.7): download a JDK archive for
//! (runtime OS, runtime architecture), extract under `<home>/java/`.

use std::io::Write;
use std::path::PathBuf;

use dh_types::DhError;

use crate::java::detect::{JavaInfo, JavaSource};
use crate::Paths;

/// Downloads and extracts a JDK archive. Production code fetches from a
/// JDK distributor; kept behind a trait so install orchestration is
/// testable without network access, matching the pattern used for
/// `EnvBuilder` and `VersionIndex` elsewhere in the core.
pub trait JdkFetcher {
    fn fetch_and_extract(&self, dest: &PathBuf, jdk_version: &str) -> Result<(), DhError>;
}

pub struct HttpJdkFetcher;

impl JdkFetcher for HttpJdkFetcher {
    fn fetch_and_extract(&self, dest: &PathBuf, jdk_version: &str) -> Result<(), DhError> {
        let (os, arch) = current_platform();
        let url = format!(
            "https://api.adoptium.net/v3/binary/latest/{jdk_version}/ga/{os}/{arch}/jdk/hotspot/normal/eclipse"
        );
        let bytes = reqwest_blocking_get(&url)?;
        let archive_path = dest.with_extension("tar.gz");
        std::fs::create_dir_all(dest).map_err(|e| DhError::permission_denied(e.to_string()))?;
        let mut file = std::fs::File::create(&archive_path)
            .map_err(|e| DhError::permission_denied(e.to_string()))?;
        file.write_all(&bytes)
            .map_err(|e| DhError::permission_denied(e.to_string()))?;

        let status = std::process::Command::new("tar")
            .args(["xzf"])
            .arg(&archive_path)
            .arg("-C")
            .arg(dest)
            .arg("--strip-components=1")
            .status()
            .map_err(|e| DhError::install_failed(format!("failed to run tar: {e}")))?;
        let _ = std::fs::remove_file(&archive_path);
        if !status.success() {
            return Err(DhError::install_failed("failed to extract JDK archive"));
        }
        Ok(())
    }
}

fn current_platform() -> (&'static str, &'static str) {
    let os = if cfg!(target_os = "macos") {
        "mac"
    } else {
        "linux"
    };
    let arch = if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else {
        "x64"
    };
    (os, arch)
}

fn reqwest_blocking_get(url: &str) -> Result<Vec<u8>, DhError> {
    // A dedicated runtime avoids requiring callers to already be inside one;
    // install is a rare, one-shot operation.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| DhError::network_error(e.to_string()))?;
    rt.block_on(async {
        let resp = reqwest::get(url)
            .await
            .map_err(|e| DhError::network_error(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DhError::network_error(format!(
                "JDK download returned {}",
                resp.status()
            )));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| DhError::network_error(e.to_string()))
    })
}

pub fn install_jdk(
    paths: &Paths,
    fetcher: &dyn JdkFetcher,
    jdk_version: &str,
    force: bool,
) -> Result<JavaInfo, DhError> {
    let dest = paths.java_dir().join(jdk_version);
    if dest.exists() && !force {
        return Err(DhError::install_failed(format!(
            "{} already exists; pass force to reinstall",
            dest.display()
        )));
    }
    if dest.exists() {
        std::fs::remove_dir_all(&dest).map_err(|e| DhError::permission_denied(e.to_string()))?;
    }

    let result = fetcher.fetch_and_extract(&dest, jdk_version);
    if result.is_err() {
        let _ = std::fs::remove_dir_all(&dest);
        return result.map(|_| unreachable!());
    }

    let java_bin = dest.join("bin").join("java");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(&java_bin) {
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | 0o111);
            let _ = std::fs::set_permissions(&java_bin, perms);
        }
    }

    Ok(JavaInfo {
        binary: java_bin,
        version: jdk_version.parse().unwrap_or(0),
        source: JavaSource::Managed,
    })
}
