//! Java detection chain (§4.7): `$JAVA_HOME/bin/java`, then `java` on
//! PATH, then any `<home>/java/*/bin/java`, each checked for major version
//! >= 17.

use std::path::{Path, PathBuf};
use std::process::Command;

use dh_types::DhError;

use crate::Paths;

pub const MIN_JAVA_VERSION: u32 = 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JavaSource {
    JavaHome,
    Path,
    Managed,
}

#[derive(Debug, Clone)]
pub struct JavaInfo {
    pub binary: PathBuf,
    pub version: u32,
    pub source: JavaSource,
}

pub fn detect(paths: &Paths) -> Result<JavaInfo, DhError> {
    if let Ok(home) = std::env::var("JAVA_HOME") {
        let candidate = PathBuf::from(home).join("bin").join("java");
        if let Some(version) = probe(&candidate) {
            if version >= MIN_JAVA_VERSION {
                return Ok(JavaInfo {
                    binary: candidate,
                    version,
                    source: JavaSource::JavaHome,
                });
            }
        }
    }

    if let Some(version) = probe(Path::new("java")) {
        if version >= MIN_JAVA_VERSION {
            return Ok(JavaInfo {
                binary: PathBuf::from("java"),
                version,
                source: JavaSource::Path,
            });
        }
    }

    let managed_dir = paths.java_dir();
    if let Ok(entries) = std::fs::read_dir(&managed_dir) {
        for entry in entries.flatten() {
            let candidate = entry.path().join("bin").join("java");
            if let Some(version) = probe(&candidate) {
                if version >= MIN_JAVA_VERSION {
                    return Ok(JavaInfo {
                        binary: candidate,
                        version,
                        source: JavaSource::Managed,
                    });
                }
            }
        }
    }

    Err(DhError::java_not_found(format!(
        "no JDK >= {MIN_JAVA_VERSION} found via JAVA_HOME, PATH, or {}",
        managed_dir.display()
    )))
}

/// Runs `<binary> -version` and parses the major version out of stderr,
/// e.g. `openjdk version "17.0.9" ...` or `java version "1.8.0_392"`
/// (pre-9 double-digit scheme maps to major 8).
fn probe(binary: &Path) -> Option<u32> {
    let output = Command::new(binary).arg("-version").output().ok()?;
    let text = String::from_utf8_lossy(&output.stderr);
    parse_java_version(&text)
}

fn parse_java_version(text: &str) -> Option<u32> {
    let start = text.find('"')? + 1;
    let rest = &text[start..];
    let end = rest.find('"')?;
    let version_str = &rest[..end];

    if let Some(stripped) = version_str.strip_prefix("1.") {
        let major: u32 = stripped.split('.').next()?.parse().ok()?;
        return Some(major);
    }
    let major: u32 = version_str.split(['.', '-', '+']).next()?.parse().ok()?;
    Some(major)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modern_version_scheme() {
        assert_eq!(
            parse_java_version("openjdk version \"17.0.9\" 2023-10-17\n"),
            Some(17)
        );
    }

    #[test]
    fn parses_legacy_1_x_scheme() {
        assert_eq!(
            parse_java_version("java version \"1.8.0_392\"\n"),
            Some(8)
        );
    }

    #[test]
    fn rejects_unparseable_text() {
        assert_eq!(parse_java_version("no quotes here"), None);
    }
}
