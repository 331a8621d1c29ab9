//! File-watch routing — which server cares about which changed path.
//!
//! Change batches arrive host-shaped; each active server only hears about
//! paths under its own project root that pass the watched-file filter.
//! Renames fan out into a delete of the old path and a create of the new.

use std::path::{Component, Path, PathBuf};

use crate::types::{ChangeEvent, FileAction, WatchedChange, WatchedChangeKind};

/// Fold `.` and `..` components without touching the filesystem.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir => {}
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// First registered root containing `file`, in registration order.
///
/// Containment is component-wise, so `/proj` never claims `/project/a.rs`.
pub(crate) fn project_root_for<'a>(roots: &'a [PathBuf], file: &Path) -> Option<&'a Path> {
    let file = normalize_path(file);
    roots
        .iter()
        .map(PathBuf::as_path)
        .find(|root| file.starts_with(root))
}

/// Translate the events landing under `root` into wire change records.
pub(crate) fn changes_for_root(
    root: &Path,
    events: &[ChangeEvent],
    eligible: &dyn Fn(&Path) -> bool,
) -> Vec<WatchedChange> {
    let mut changes = Vec::new();
    for event in events {
        match event.action {
            FileAction::Created => {
                push_change(&mut changes, root, eligible, &event.path, WatchedChangeKind::Created);
            }
            FileAction::Modified => {
                push_change(&mut changes, root, eligible, &event.path, WatchedChangeKind::Changed);
            }
            FileAction::Deleted => {
                push_change(&mut changes, root, eligible, &event.path, WatchedChangeKind::Deleted);
            }
            FileAction::Renamed => {
                if let Some(old_path) = &event.old_path {
                    push_change(&mut changes, root, eligible, old_path, WatchedChangeKind::Deleted);
                }
                push_change(&mut changes, root, eligible, &event.path, WatchedChangeKind::Created);
            }
        }
    }
    changes
}

fn push_change(
    changes: &mut Vec<WatchedChange>,
    root: &Path,
    eligible: &dyn Fn(&Path) -> bool,
    path: &Path,
    kind: WatchedChangeKind,
) {
    let path = normalize_path(path);
    if path.starts_with(root) && eligible(&path) {
        changes.push(WatchedChange { path, kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(_: &Path) -> bool {
        true
    }

    #[test]
    fn test_normalize_folds_dots() {
        assert_eq!(
            normalize_path(Path::new("/a/./b/../c/file.rs")),
            PathBuf::from("/a/c/file.rs")
        );
    }

    #[test]
    fn test_root_match_is_component_wise() {
        let roots = vec![PathBuf::from("/proj")];
        assert!(project_root_for(&roots, Path::new("/proj/a.rs")).is_some());
        assert!(project_root_for(&roots, Path::new("/project/a.rs")).is_none());
    }

    #[test]
    fn test_first_registered_root_wins() {
        let roots = vec![PathBuf::from("/a"), PathBuf::from("/a/b")];
        assert_eq!(
            project_root_for(&roots, Path::new("/a/b/c.rs")),
            Some(Path::new("/a"))
        );

        let reversed = vec![PathBuf::from("/a/b"), PathBuf::from("/a")];
        assert_eq!(
            project_root_for(&reversed, Path::new("/a/b/c.rs")),
            Some(Path::new("/a/b"))
        );
    }

    #[test]
    fn test_no_root_for_outside_path() {
        let roots = vec![PathBuf::from("/proj")];
        assert!(project_root_for(&roots, Path::new("/other/b.rs")).is_none());
    }

    #[test]
    fn test_changes_outside_root_are_dropped() {
        let events = vec![
            ChangeEvent::new(FileAction::Modified, "/proj/a.txt"),
            ChangeEvent::new(FileAction::Modified, "/other/b.txt"),
        ];
        let changes = changes_for_root(Path::new("/proj"), &events, &any);
        assert_eq!(
            changes,
            vec![WatchedChange {
                path: PathBuf::from("/proj/a.txt"),
                kind: WatchedChangeKind::Changed,
            }]
        );
    }

    #[test]
    fn test_rename_fans_out_into_delete_and_create() {
        let events = vec![ChangeEvent::renamed("/proj/old.txt", "/proj/new.txt")];
        let changes = changes_for_root(Path::new("/proj"), &events, &any);
        assert_eq!(
            changes,
            vec![
                WatchedChange {
                    path: PathBuf::from("/proj/old.txt"),
                    kind: WatchedChangeKind::Deleted,
                },
                WatchedChange {
                    path: PathBuf::from("/proj/new.txt"),
                    kind: WatchedChangeKind::Created,
                },
            ]
        );
    }

    #[test]
    fn test_rename_from_outside_only_creates() {
        let events = vec![ChangeEvent::renamed("/elsewhere/old.txt", "/proj/new.txt")];
        let changes = changes_for_root(Path::new("/proj"), &events, &any);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, WatchedChangeKind::Created);
    }

    #[test]
    fn test_eligibility_filter_applies_per_path() {
        let no_logs = |path: &Path| path.extension().is_none_or(|ext| ext != "log");
        let events = vec![
            ChangeEvent::new(FileAction::Created, "/proj/a.rs"),
            ChangeEvent::new(FileAction::Created, "/proj/debug.log"),
        ];
        let changes = changes_for_root(Path::new("/proj"), &events, &no_logs);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, PathBuf::from("/proj/a.rs"));
    }

    #[test]
    fn test_deleted_and_created_kinds_map_through() {
        let events = vec![
            ChangeEvent::new(FileAction::Created, "/proj/new.rs"),
            ChangeEvent::new(FileAction::Deleted, "/proj/gone.rs"),
        ];
        let changes = changes_for_root(Path::new("/proj"), &events, &any);
        assert_eq!(changes[0].kind, WatchedChangeKind::Created);
        assert_eq!(changes[1].kind, WatchedChangeKind::Deleted);
    }
}
