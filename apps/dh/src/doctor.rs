//! `dh doctor [--fix]` (§4.8). Composes checks from every subsystem into a
//! single health report, grounded in the teacher installer's
//! `run_preflight_checks()` / `run_verification()` pattern: a plain
//! `Vec<CheckItem>` built by pushing one check function's result at a
//! time.

use serde::Serialize;

use crate::config::Config;
use crate::java;
use crate::version;
use crate::Paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckItem {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckItem {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub healthy: bool,
    pub checks: Vec<CheckItem>,
}

const FREE_DISK_WARNING_GIB: u64 = 5;

pub fn run(paths: &Paths, env_builder_bin: &std::path::Path, fix: bool) -> DoctorReport {
    let mut checks = Vec::new();

    checks.push(check_env_builder(env_builder_bin));
    checks.push(check_java(paths, fix));
    checks.push(check_any_version_installed(paths));
    checks.push(check_default_version(paths, fix));
    checks.push(check_disk_space(paths));

    let healthy = !checks.iter().any(|c| c.status == CheckStatus::Error);
    DoctorReport { healthy, checks }
}

fn check_env_builder(bin: &std::path::Path) -> CheckItem {
    if bin.exists() {
        CheckItem::new("env-builder", CheckStatus::Ok, bin.display().to_string())
    } else {
        CheckItem::new(
            "env-builder",
            CheckStatus::Error,
            format!("{} not found; install it to manage Python environments", bin.display()),
        )
    }
}

fn check_java(paths: &Paths, fix: bool) -> CheckItem {
    match java::detect(paths) {
        Ok(info) => CheckItem::new(
            "java",
            CheckStatus::Ok,
            format!("{} (java {}, via {:?})", info.binary.display(), info.version, info.source),
        ),
        Err(e) if fix => {
            // Bounded remediation: attempt to download the minimum JDK.
            let fetcher = java::install::HttpJdkFetcher;
            match java::install_jdk(paths, &fetcher, "17", false) {
                Ok(info) => CheckItem::new(
                    "java",
                    CheckStatus::Ok,
                    format!("installed {}", info.binary.display()),
                ),
                Err(fix_err) => CheckItem::new(
                    "java",
                    CheckStatus::Error,
                    format!("{e}; auto-fix failed: {fix_err}"),
                ),
            }
        }
        Err(e) => CheckItem::new("java", CheckStatus::Error, e.message),
    }
}

fn check_any_version_installed(paths: &Paths) -> CheckItem {
    match version::list_installed(paths) {
        Ok(list) if !list.is_empty() => CheckItem::new(
            "engine-versions",
            CheckStatus::Ok,
            format!("{} version(s) installed", list.len()),
        ),
        Ok(_) => CheckItem::new(
            "engine-versions",
            CheckStatus::Error,
            "no engine versions installed; run `dh install`",
        ),
        Err(e) => CheckItem::new("engine-versions", CheckStatus::Error, e.message),
    }
}

fn check_default_version(paths: &Paths, fix: bool) -> CheckItem {
    let config = match Config::load(paths) {
        Ok(c) => c,
        Err(e) => return CheckItem::new("default-version", CheckStatus::Error, e.message),
    };

    match config.default_version {
        Some(v) if paths.version_dir(&dh_types::EngineVersion::new(&v)).exists() => {
            CheckItem::new("default-version", CheckStatus::Ok, v)
        }
        Some(v) => CheckItem::new(
            "default-version",
            CheckStatus::Error,
            format!("default version {v} configured but not installed"),
        ),
        None if fix => {
            if let Ok(installed) = version::list_installed(paths) {
                if let Some(newest) = installed.into_iter().next() {
                    let mut config = config;
                    config.default_version = Some(newest.version.as_str().to_string());
                    if config.save(paths).is_ok() {
                        return CheckItem::new(
                            "default-version",
                            CheckStatus::Ok,
                            format!("set default to newest installed version {}", newest.version),
                        );
                    }
                }
            }
            CheckItem::new(
                "default-version",
                CheckStatus::Error,
                "no default version configured and no installed version to fall back to",
            )
        }
        None => CheckItem::new(
            "default-version",
            CheckStatus::Error,
            "no default version configured; run `dh use <version>`",
        ),
    }
}

fn check_disk_space(paths: &Paths) -> CheckItem {
    match free_space_gib(&paths.root) {
        Some(gib) if gib >= FREE_DISK_WARNING_GIB => {
            CheckItem::new("disk-space", CheckStatus::Ok, format!("{gib} GiB free"))
        }
        Some(gib) => CheckItem::new(
            "disk-space",
            CheckStatus::Warning,
            format!("only {gib} GiB free under {}", paths.root.display()),
        ),
        None => CheckItem::new(
            "disk-space",
            CheckStatus::Warning,
            "could not determine free disk space",
        ),
    }
}

#[cfg(unix)]
fn free_space_gib(path: &std::path::Path) -> Option<u64> {
    let dir = if path.exists() {
        path.to_path_buf()
    } else {
        path.parent()?.to_path_buf()
    };
    let c_path = std::ffi::CString::new(dir.to_string_lossy().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let bytes = stat.f_bavail as u64 * stat.f_frsize as u64;
    Some(bytes / (1024 * 1024 * 1024))
}

#[cfg(not(unix))]
fn free_space_gib(_path: &std::path::Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_false_if_any_error() {
        let checks = vec![
            CheckItem::new("a", CheckStatus::Ok, ""),
            CheckItem::new("b", CheckStatus::Warning, ""),
            CheckItem::new("c", CheckStatus::Error, ""),
        ];
        let healthy = !checks.iter().any(|c| c.status == CheckStatus::Error);
        assert!(!healthy);
    }

    #[test]
    fn healthy_true_with_only_warnings() {
        let checks = vec![
            CheckItem::new("a", CheckStatus::Ok, ""),
            CheckItem::new("b", CheckStatus::Warning, ""),
        ];
        let healthy = !checks.iter().any(|c| c.status == CheckStatus::Error);
        assert!(healthy);
    }
}
