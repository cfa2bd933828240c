//! File-watch subscriptions.
//!
//! The session registers two glob subscriptions — Rego sources and the
//! project-local Regal configuration file — and forwards matching events
//! to the server. [`spawn`] provides a real filesystem watcher for hosts
//! without their own watch facility; hosts that have one can feed
//! [`FileEvent`]s into the session directly.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::errors::StartError;
use crate::types::{FileChangeKind, FileEvent};

/// Compile the configured watch patterns into one matcher.
pub(crate) fn compile_globs(patterns: &[String]) -> Result<GlobSet, StartError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| StartError::BadWatchGlob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| StartError::BadWatchGlob {
        pattern: patterns.join(", "),
        source,
    })
}

fn change_kind(kind: notify::EventKind) -> Option<FileChangeKind> {
    match kind {
        notify::EventKind::Create(_) => Some(FileChangeKind::Created),
        notify::EventKind::Modify(_) => Some(FileChangeKind::Changed),
        notify::EventKind::Remove(_) => Some(FileChangeKind::Deleted),
        _ => None,
    }
}

/// Keeps the underlying watcher alive. Dropping it stops the stream.
pub struct WorkspaceWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch `root` recursively and stream create/change/delete events.
///
/// Events are forwarded one at a time in arrival order — no debounce, no
/// batching; ordering is part of the session's contract with the server.
pub fn spawn(
    root: &Path,
    queue: usize,
) -> Result<(WorkspaceWatcher, mpsc::Receiver<FileEvent>), notify::Error> {
    let (tx, rx) = mpsc::channel(queue);
    let mut watcher =
        notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
            match result {
                Ok(event) => {
                    let Some(kind) = change_kind(event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        if tx.blocking_send(FileEvent { path, kind }).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!(err = %e, "file watcher error"),
            }
        })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((WorkspaceWatcher { _watcher: watcher }, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{REGAL_CONFIG_GLOB, REGO_SOURCE_GLOB};
    use std::path::PathBuf;

    fn default_globs() -> GlobSet {
        compile_globs(&[
            REGO_SOURCE_GLOB.to_string(),
            REGAL_CONFIG_GLOB.to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn test_source_glob_matches_nested_rego_files() {
        let globs = default_globs();
        assert!(globs.is_match(Path::new("/w/authz.rego")));
        assert!(globs.is_match(Path::new("/w/policies/deep/nested/rbac.rego")));
        assert!(globs.is_match(Path::new("authz.rego")));
    }

    #[test]
    fn test_config_glob_matches_only_the_regal_config() {
        let globs = default_globs();
        assert!(globs.is_match(Path::new("/w/.regal/config.yaml")));
        assert!(globs.is_match(Path::new("/w/sub/.regal/config.yaml")));
        assert!(!globs.is_match(Path::new("/w/.regal/other.yaml")));
        assert!(!globs.is_match(Path::new("/w/config.yaml")));
    }

    #[test]
    fn test_non_matching_paths_rejected() {
        let globs = default_globs();
        assert!(!globs.is_match(Path::new("/w/main.go")));
        assert!(!globs.is_match(Path::new("/w/policies/README.md")));
        assert!(!globs.is_match(Path::new("/w/authz.rego.bak")));
    }

    #[test]
    fn test_exactly_two_default_subscriptions() {
        let globs = default_globs();
        assert_eq!(globs.len(), 2);
    }

    #[test]
    fn test_bad_glob_is_a_start_error() {
        let error = compile_globs(&["[".to_string()]).unwrap_err();
        assert!(matches!(error, StartError::BadWatchGlob { .. }));
        assert!(error.to_string().contains('['));
    }

    #[test]
    fn test_modify_and_remove_kinds_map_to_lsp_values() {
        use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
        assert_eq!(
            change_kind(notify::EventKind::Create(CreateKind::File)),
            Some(FileChangeKind::Created)
        );
        assert_eq!(
            change_kind(notify::EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            Some(FileChangeKind::Changed)
        );
        assert_eq!(
            change_kind(notify::EventKind::Remove(RemoveKind::File)),
            Some(FileChangeKind::Deleted)
        );
        assert_eq!(change_kind(notify::EventKind::Access(notify::event::AccessKind::Any)), None);
    }

    #[tokio::test]
    async fn test_watcher_reports_created_file() {
        // The watcher delivers from its own OS thread, so the
        // current-thread test runtime is enough.
        let dir = tempfile::tempdir().unwrap();
        let (watcher, mut rx) = spawn(dir.path(), 64).unwrap();

        let target: PathBuf = dir.path().join("authz.rego");
        std::fs::write(&target, "package authz\n").unwrap();

        // The backend may report the write as Create, Modify, or both;
        // any event for the new path satisfies the contract.
        let event = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .expect("no filesystem event within 10s")
            .expect("watcher stream ended");
        assert!(event.path.ends_with("authz.rego"));

        drop(watcher);
    }
}
