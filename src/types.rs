//! Public types shared by the manager, the watch router and the host.
//!
//! The host constructs [`LaunchConfig`] and [`ChangeEvent`] batches, hands
//! in [`SessionMeta`] at registration, and gets [`SessionId`] handles back.
//! Protocol payloads themselves stay `serde_json::Value` — this crate
//! transports them without interpreting them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Stable handle for a registered client session.
///
/// Assigned by the manager's session arena; the session→server association
/// is keyed by this handle, never by reference identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    /// The raw arena index, for host-side bookkeeping.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// What the manager knows about a session.
///
/// This is also the value the injected eligibility predicate receives.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    /// Backing file of the session. `None` for unsaved buffers, which are
    /// never routed to a server.
    pub file_path: Option<PathBuf>,
    /// Grammar / language identifier, if the host has detected one.
    pub language: Option<String>,
}

impl SessionMeta {
    /// Meta for a session backed by a file on disk.
    #[must_use]
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Some(path.into()),
            language: None,
        }
    }
}

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// One file-system change as reported by the host's watcher.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub action: FileAction,
    pub path: PathBuf,
    /// Previous path, set for [`FileAction::Renamed`] only.
    pub old_path: Option<PathBuf>,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(action: FileAction, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            path: path.into(),
            old_path: None,
        }
    }

    #[must_use]
    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            action: FileAction::Renamed,
            path: to.into(),
            old_path: Some(from.into()),
        }
    }
}

/// Change kind on the wire (`FileChangeType` numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedChangeKind {
    Created,
    Changed,
    Deleted,
}

impl WatchedChangeKind {
    /// Numeric code used in `workspace/didChangeWatchedFiles` payloads.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Changed => 2,
            Self::Deleted => 3,
        }
    }
}

/// One change record as forwarded to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedChange {
    pub path: PathBuf,
    pub kind: WatchedChangeKind,
}

/// Launch recipe for a native language-server process.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchConfig {
    /// Executable name, resolved against PATH (e.g. "rust-analyzer").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment entries for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Server-specific `initializationOptions` payload.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

/// Glob-backed watched-file eligibility predicate.
///
/// A ready-made implementation of the filter consulted by the watch router;
/// hosts with richer rules inject a closure instead.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    set: globset::GlobSet,
}

impl WatchFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = globset::GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(globset::Glob::new(pattern.as_ref())?);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        self.set.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_meta_for_file() {
        let meta = SessionMeta::for_file("/work/src/main.rs");
        assert_eq!(meta.file_path, Some(PathBuf::from("/work/src/main.rs")));
        assert!(meta.language.is_none());
    }

    #[test]
    fn test_change_event_rename_carries_old_path() {
        let event = ChangeEvent::renamed("/w/old.rs", "/w/new.rs");
        assert_eq!(event.action, FileAction::Renamed);
        assert_eq!(event.path, PathBuf::from("/w/new.rs"));
        assert_eq!(event.old_path, Some(PathBuf::from("/w/old.rs")));
    }

    #[test]
    fn test_watched_change_kind_codes() {
        assert_eq!(WatchedChangeKind::Created.code(), 1);
        assert_eq!(WatchedChangeKind::Changed.code(), 2);
        assert_eq!(WatchedChangeKind::Deleted.code(), 3);
    }

    #[test]
    fn test_launch_config_defaults() {
        let config: LaunchConfig =
            serde_json::from_value(serde_json::json!({ "command": "rust-analyzer" })).unwrap();
        assert_eq!(config.command, "rust-analyzer");
        assert!(config.args.is_empty());
        assert!(config.env.is_empty());
        assert!(config.initialization_options.is_none());
    }

    #[test]
    fn test_watch_filter_globs() {
        let filter = WatchFilter::new(["**/*.rs", "**/Cargo.toml"]).unwrap();
        assert!(filter.matches(Path::new("/w/src/lib.rs")));
        assert!(filter.matches(Path::new("/w/Cargo.toml")));
        assert!(!filter.matches(Path::new("/w/readme.md")));
    }

    #[test]
    fn test_watch_filter_rejects_bad_pattern() {
        assert!(WatchFilter::new(["a{"]).is_err());
    }
}
