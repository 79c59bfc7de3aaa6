//! Open-document store.
//!
//! Contents are owned here exclusively; readers get `Arc` snapshots.
//! Incremental edits that fall outside the document are hard errors —
//! the caller removes the draft, because a desynchronized client is
//! better served by failing requests than by silently wrong text.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nixd_core::NixdError;
use tower_lsp::lsp_types::TextDocumentContentChangeEvent;

use crate::helpers::position_to_offset;

#[derive(Debug, Clone)]
pub struct Draft {
    pub version: i64,
    pub contents: Arc<String>,
}

#[derive(Default)]
pub struct DraftStore {
    inner: Mutex<HashMap<PathBuf, Draft>>,
}

impl DraftStore {
    pub fn new() -> Self {
        DraftStore::default()
    }

    pub fn add_draft(&self, path: PathBuf, version: i64, contents: String) {
        self.inner.lock().unwrap().insert(
            path,
            Draft {
                version,
                contents: Arc::new(contents),
            },
        );
    }

    pub fn get_draft(&self, path: &Path) -> Option<Draft> {
        self.inner.lock().unwrap().get(path).cloned()
    }

    pub fn remove_draft(&self, path: &Path) {
        self.inner.lock().unwrap().remove(path);
    }

    /// Snapshot of all drafts, for seeding a fresh worker.
    pub fn all(&self) -> Vec<(PathBuf, Draft)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Apply one LSP content change to `contents`. A missing range replaces
/// the whole document; otherwise the range is resolved to byte offsets
/// and spliced.
pub fn apply_change(
    contents: &mut String,
    change: &TextDocumentContentChangeEvent,
) -> Result<(), NixdError> {
    let Some(range) = change.range else {
        *contents = change.text.clone();
        return Ok(());
    };

    let start = position_to_offset(contents, range.start)?;
    let end = position_to_offset(contents, range.end)?;
    if start > end {
        return Err(NixdError::Protocol(format!(
            "change range is inverted ({start} > {end})"
        )));
    }
    contents.replace_range(start..end, &change.text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::{Position, Range};

    fn change(range: Option<((u32, u32), (u32, u32))>, text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: range.map(|((sl, sc), (el, ec))| Range {
                start: Position::new(sl, sc),
                end: Position::new(el, ec),
            }),
            range_length: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn full_text_change_replaces_contents() {
        let mut text = "old".to_string();
        apply_change(&mut text, &change(None, "new")).unwrap();
        assert_eq!(text, "new");
    }

    #[test]
    fn incremental_insert() {
        let mut text = "let x = 1; in x".to_string();
        apply_change(&mut text, &change(Some(((0, 8), (0, 9))), "42")).unwrap();
        assert_eq!(text, "let x = 42; in x");
    }

    #[test]
    fn incremental_delete_across_lines() {
        let mut text = "a\nb\nc".to_string();
        apply_change(&mut text, &change(Some(((0, 1), (2, 0))), " ")).unwrap();
        assert_eq!(text, "a c");
    }

    #[test]
    fn out_of_bounds_range_is_a_hard_error() {
        let mut text = "short".to_string();
        assert!(apply_change(&mut text, &change(Some(((3, 0), (3, 1))), "x")).is_err());
        assert!(apply_change(&mut text, &change(Some(((0, 9), (0, 10))), "x")).is_err());
        // The document is untouched after a failed change.
        assert_eq!(text, "short");
    }

    #[test]
    fn store_lifecycle() {
        let store = DraftStore::new();
        store.add_draft(PathBuf::from("/f.nix"), 1, "a".into());
        assert_eq!(store.get_draft(Path::new("/f.nix")).unwrap().version, 1);

        store.add_draft(PathBuf::from("/f.nix"), 2, "b".into());
        let draft = store.get_draft(Path::new("/f.nix")).unwrap();
        assert_eq!(draft.version, 2);
        assert_eq!(*draft.contents, "b");

        store.remove_draft(Path::new("/f.nix"));
        assert!(store.get_draft(Path::new("/f.nix")).is_none());
        assert!(store.all().is_empty());
    }
}
