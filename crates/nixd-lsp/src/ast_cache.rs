//! Versioned parse cache.
//!
//! `sched_parse` runs the parse off the request path and publishes the
//! result; entries are immutable `Arc`s once published, so borrowers
//! share without locks. `with_ast` suspends a request until an AST of
//! sufficient version is ready, falling back to the best available
//! (possibly stale) entry at the deadline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nixd_core::{Ast, NixdError};
use tokio::sync::Notify;

/// How long `with_ast` waits for the scheduled parse before settling
/// for a stale entry (or declining).
const AST_WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AstEntry {
    pub version: i64,
    pub ast: Arc<Ast>,
    pub errors: Arc<Vec<NixdError>>,
}

#[derive(Default)]
pub struct AstCache {
    entries: Mutex<HashMap<PathBuf, AstEntry>>,
    ready: Arc<Notify>,
}

impl AstCache {
    pub fn new() -> Self {
        AstCache::default()
    }

    /// Enqueue a parse of `contents`. The published entry replaces any
    /// existing entry for `path` with a lesser or equal version.
    pub fn sched_parse(self: &Arc<Self>, contents: String, path: PathBuf, version: i64) {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = nixd_parser::parse(&contents);
            cache.publish(path, version, Arc::new(result.ast), Arc::new(result.errors));
        });
    }

    /// Publish a parsed AST. Exposed for worker loops that parse
    /// synchronously.
    pub fn publish(&self, path: PathBuf, version: i64, ast: Arc<Ast>, errors: Arc<Vec<NixdError>>) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&path) {
            Some(existing) if existing.version > version => {}
            _ => {
                entries.insert(
                    path,
                    AstEntry {
                        version,
                        ast,
                        errors,
                    },
                );
            }
        }
        drop(entries);
        self.ready.notify_waiters();
    }

    pub fn get(&self, path: &Path) -> Option<AstEntry> {
        self.entries.lock().unwrap().get(path).cloned()
    }

    pub fn remove(&self, path: &Path) {
        self.entries.lock().unwrap().remove(path);
    }

    /// Run `f` with the most recent AST for `path` whose version is at
    /// least `version`. Waits for the scheduled parse up to a bounded
    /// timeout, then falls back to the best available entry; `None` only
    /// when no AST exists at all.
    pub async fn with_ast<R>(
        &self,
        path: &Path,
        version: i64,
        f: impl FnOnce(&Ast, i64) -> R,
    ) -> Option<R> {
        let deadline = tokio::time::Instant::now() + AST_WAIT;
        // `f` is consumed from inside the loop, so park it in an Option.
        let mut f = Some(f);
        loop {
            // Register interest before checking, so a publish between
            // the check and the await is not lost.
            let mut notified = std::pin::pin!(self.ready.notified());
            notified.as_mut().enable();
            if let Some(entry) = self.get(path) {
                if entry.version >= version {
                    let f = f.take().unwrap();
                    return Some(f(&entry.ast, entry.version));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Deadline: settle for whatever is there.
                let f = f.take().unwrap();
                return self.get(path).map(|entry| f(&entry.ast, entry.version));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_for(src: &str) -> (Arc<Ast>, Arc<Vec<NixdError>>) {
        let result = nixd_parser::parse(src);
        (Arc::new(result.ast), Arc::new(result.errors))
    }

    #[tokio::test]
    async fn sched_parse_publishes() {
        let cache = Arc::new(AstCache::new());
        cache.sched_parse("let x = 1; in x".into(), PathBuf::from("/f.nix"), 1);
        let got = cache
            .with_ast(Path::new("/f.nix"), 1, |ast, version| {
                (ast.len() > 0, version)
            })
            .await;
        assert_eq!(got, Some((true, 1)));
    }

    #[tokio::test]
    async fn newer_version_replaces_older() {
        let cache = Arc::new(AstCache::new());
        let (a1, e1) = entry_for("1");
        let (a2, e2) = entry_for("2");
        cache.publish(PathBuf::from("/f.nix"), 1, a1, e1);
        cache.publish(PathBuf::from("/f.nix"), 2, a2, e2);
        assert_eq!(cache.get(Path::new("/f.nix")).unwrap().version, 2);
    }

    #[tokio::test]
    async fn stale_publish_is_ignored() {
        let cache = Arc::new(AstCache::new());
        let (a2, e2) = entry_for("2");
        let (a1, e1) = entry_for("1");
        cache.publish(PathBuf::from("/f.nix"), 2, a2, e2);
        cache.publish(PathBuf::from("/f.nix"), 1, a1, e1);
        assert_eq!(cache.get(Path::new("/f.nix")).unwrap().version, 2);
    }

    #[tokio::test]
    async fn equal_version_republish_wins() {
        // "lesser or equal" is replaced: a reparse of the same version
        // must land.
        let cache = Arc::new(AstCache::new());
        let (a1, e1) = entry_for("1");
        let (a2, e2) = entry_for("2");
        cache.publish(PathBuf::from("/f.nix"), 1, a1, e1);
        cache.publish(PathBuf::from("/f.nix"), 1, a2.clone(), e2);
        let got = cache.get(Path::new("/f.nix")).unwrap();
        assert!(Arc::ptr_eq(&got.ast, &a2));
    }

    #[tokio::test]
    async fn with_ast_waits_for_pending_parse() {
        let cache = Arc::new(AstCache::new());
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .with_ast(Path::new("/f.nix"), 3, |_, version| version)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (ast, errors) = entry_for("let x = 1; in x");
        cache.publish(PathBuf::from("/f.nix"), 3, ast, errors);
        assert_eq!(waiter.await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn with_ast_falls_back_to_stale_at_deadline() {
        let cache = Arc::new(AstCache::new());
        let (ast, errors) = entry_for("1");
        cache.publish(PathBuf::from("/f.nix"), 1, ast, errors);
        // Version 5 never arrives; the stale version-1 entry is used.
        let got = cache
            .with_ast(Path::new("/f.nix"), 5, |_, version| version)
            .await;
        assert_eq!(got, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn with_ast_declines_when_nothing_exists() {
        let cache = Arc::new(AstCache::new());
        let got = cache.with_ast(Path::new("/none.nix"), 0, |_, _| ()).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn parse_failures_still_publish_an_ast() {
        // S3: a truncated document publishes an AST containing Error.
        let cache = Arc::new(AstCache::new());
        cache.sched_parse("let x = ".into(), PathBuf::from("/f.nix"), 1);
        let has_error = cache
            .with_ast(Path::new("/f.nix"), 1, |ast, _| {
                ast.ids()
                    .any(|id| matches!(ast.expr(id), nixd_core::Expr::Error(_)))
            })
            .await;
        assert_eq!(has_error, Some(true));
        assert!(!cache.get(Path::new("/f.nix")).unwrap().errors.is_empty());
    }
}
