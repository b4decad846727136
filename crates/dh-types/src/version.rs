use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An engine version string in semver form ("41.1", "0.37.0"). Ordered
/// descending by the usual semver rules (§3.2): numeric component by
/// component, missing trailing components treated as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineVersion {
    raw: String,
}

impl EngineVersion {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn components(&self) -> Vec<u64> {
        self.raw
            .split(|c| c == '.' || c == '-' || c == '+')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for EngineVersion {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl PartialOrd for EngineVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EngineVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.components();
        let b = other.components();
        let len = a.len().max(b.len());
        for i in 0..len {
            let ai = a.get(i).copied().unwrap_or(0);
            let bi = b.get(i).copied().unwrap_or(0);
            match ai.cmp(&bi) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

/// Sorts versions descending (newest first), as required wherever the spec
/// asks for "lexicographically-greatest (by semver)" or "sort descending".
pub fn sort_descending(versions: &mut [EngineVersion]) {
    versions.sort_by(|a, b| b.cmp(a));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_numeric_component() {
        let mut versions = vec![
            EngineVersion::new("0.37.0"),
            EngineVersion::new("41.1"),
            EngineVersion::new("41.10"),
            EngineVersion::new("41.2"),
        ];
        sort_descending(&mut versions);
        assert_eq!(
            versions.iter().map(|v| v.as_str()).collect::<Vec<_>>(),
            vec!["41.10", "41.2", "41.1", "0.37.0"]
        );
    }

    #[test]
    fn missing_trailing_component_treated_as_zero() {
        assert!(EngineVersion::new("41.1") > EngineVersion::new("41.0.9"));
        assert!(EngineVersion::new("41") == EngineVersion::new("41.0"));
    }
}
