//! Command history (§4.4.4): file-backed, capped, deduplicating. Accepts
//! both on-disk formats on read (legacy bare-line and JSON-escaped),
//! always writes JSON-escaped (Open Question decision, SPEC_FULL §12).

use std::path::Path;

use dh_types::DhError;

const MAX_ENTRIES: usize = 500;

pub struct History {
    entries: Vec<String>,
    /// `None` means "not navigating"; `Some(i)` indexes into `entries`
    /// from the end (0 = most recent).
    cursor: Option<usize>,
    draft: String,
    path: std::path::PathBuf,
}

impl History {
    pub fn load(path: &Path) -> Result<Self, DhError> {
        let entries = match std::fs::read_to_string(path) {
            Ok(text) => text.lines().filter_map(parse_line).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(DhError::config_error(e.to_string())),
        };
        Ok(Self {
            entries,
            cursor: None,
            draft: String::new(),
            path: path.to_path_buf(),
        })
    }

    /// Adds `entry` unless it duplicates the most recent one, resets
    /// navigation, and persists to disk (Testable Property 6).
    pub fn add(&mut self, entry: &str) -> Result<(), DhError> {
        self.cursor = None;
        self.draft.clear();
        if self.entries.last().map(String::as_str) == Some(entry) {
            return Ok(());
        }
        self.entries.push(entry.to_string());
        if self.entries.len() > MAX_ENTRIES {
            let overflow = self.entries.len() - MAX_ENTRIES;
            self.entries.drain(0..overflow);
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), DhError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DhError::permission_denied(e.to_string()))?;
        }
        let text: String = self
            .entries
            .iter()
            .map(|e| format!("{}\n", serde_json::to_string(e).unwrap_or_default()))
            .collect();
        std::fs::write(&self.path, text).map_err(|e| DhError::permission_denied(e.to_string()))
    }

    /// Up arrow: first press saves the current draft, subsequent presses
    /// walk further back. Returns `None` at the oldest entry.
    pub fn up(&mut self, current_draft: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let next_index = match self.cursor {
            None => {
                self.draft = current_draft.to_string();
                0
            }
            Some(i) if i + 1 < self.entries.len() => i + 1,
            Some(i) => i,
        };
        self.cursor = Some(next_index);
        self.entries.iter().rev().nth(next_index).map(String::as_str)
    }

    /// Down arrow: walks forward; pressing down past the newest restores
    /// the saved draft and clears navigation.
    pub fn down(&mut self) -> Option<&str> {
        match self.cursor {
            None => None,
            Some(0) => {
                self.cursor = None;
                Some(self.draft.as_str())
            }
            Some(i) => {
                self.cursor = Some(i - 1);
                self.entries.iter().rev().nth(i - 1).map(String::as_str)
            }
        }
    }

    /// Reverse-i-search: matches newest-first.
    pub fn search(&self, needle: &str) -> Vec<&str> {
        if needle.is_empty() {
            return Vec::new();
        }
        self.entries
            .iter()
            .rev()
            .filter(|e| e.contains(needle))
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accepts a JSON-escaped line (`"foo\n"`-style) or, for backwards
/// compatibility, a plain bare line with no quoting.
fn parse_line(line: &str) -> Option<String> {
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<String>(line) {
        Ok(s) => Some(s),
        Err(_) => Some(line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_duplicate_in_succession_does_not_grow_history() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history");
        let mut history = History::load(&path).unwrap();
        history.add("t = empty_table(5)").unwrap();
        history.add("t = empty_table(5)").unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn non_consecutive_duplicate_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history");
        let mut history = History::load(&path).unwrap();
        history.add("a").unwrap();
        history.add("b").unwrap();
        history.add("a").unwrap();
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn up_then_down_restores_draft() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history");
        let mut history = History::load(&path).unwrap();
        history.add("first").unwrap();
        history.add("second").unwrap();

        assert_eq!(history.up("draft-in-progress"), Some("second"));
        assert_eq!(history.up(""), Some("first"));
        assert_eq!(history.down(), Some("second"));
        assert_eq!(history.down(), Some("draft-in-progress"));
        assert_eq!(history.down(), None);
    }

    #[test]
    fn reads_legacy_bare_lines_and_json_escaped_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history");
        std::fs::write(&path, "bare line\n\"json \\\"escaped\\\"\"\n").unwrap();
        let history = History::load(&path).unwrap();
        assert_eq!(history.entries, vec!["bare line", "json \"escaped\""]);
    }

    #[test]
    fn persisted_history_is_always_json_escaped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history");
        let mut history = History::load(&path).unwrap();
        history.add("line with \"quotes\"").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "\"line with \\\"quotes\\\"\"\n");
    }

    #[test]
    fn search_returns_matches_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history");
        let mut history = History::load(&path).unwrap();
        history.add("select from t").unwrap();
        history.add("print(1)").unwrap();
        history.add("select from u").unwrap();
        assert_eq!(history.search("select"), vec!["select from u", "select from t"]);
    }
}
