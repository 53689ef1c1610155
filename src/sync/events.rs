//! File-system events flowing through the sync pipeline

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
            EventKind::Moved => "moved",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change notification, either from the native watcher or
/// synthesized from a line of remote watcher output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemEvent {
    pub kind: EventKind,
    pub src_path: PathBuf,
    /// Destination of a move
    pub dest_path: Option<PathBuf>,
    /// True for events synthesized from remote watcher output
    pub is_synthetic: bool,
}

impl FileSystemEvent {
    pub fn new(kind: EventKind, src_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            src_path: src_path.into(),
            dest_path: None,
            is_synthetic: false,
        }
    }

    pub fn moved(src_path: impl Into<PathBuf>, dest_path: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::Moved,
            src_path: src_path.into(),
            dest_path: Some(dest_path.into()),
            is_synthetic: false,
        }
    }

    /// Remote output carries no OS metadata, so every line becomes a
    /// modification of the printed path.
    pub fn synthetic(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::Modified,
            src_path: path.into(),
            dest_path: None,
            is_synthetic: true,
        }
    }

    /// Source and destination paths touched by this event
    pub fn touched_paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.src_path.as_path()];
        if let Some(dest) = &self.dest_path {
            if dest != &self.src_path {
                paths.push(dest.as_path());
            }
        }
        paths
    }

    /// Converts a native watcher event. Access notifications (opens, closes)
    /// never reflect a content change and are dropped.
    pub fn from_notify(event: notify::Event) -> Vec<FileSystemEvent> {
        let notify::Event { kind, mut paths, .. } = event;
        let kind = match kind {
            notify::EventKind::Access(_) => return Vec::new(),
            notify::EventKind::Create(_) => EventKind::Created,
            notify::EventKind::Remove(_) => EventKind::Deleted,
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
                let dest = paths.remove(1);
                let src = paths.remove(0);
                return vec![FileSystemEvent::moved(src, dest)];
            }
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)) => EventKind::Deleted,
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::To)) => EventKind::Created,
            notify::EventKind::Modify(_) | notify::EventKind::Any | notify::EventKind::Other => {
                EventKind::Modified
            }
        };
        paths
            .into_iter()
            .map(|path| FileSystemEvent::new(kind, path))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};

    fn notify_event(kind: notify::EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn test_access_events_are_dropped() {
        let event = notify_event(notify::EventKind::Access(AccessKind::Any), &["/a/file"]);
        assert!(FileSystemEvent::from_notify(event).is_empty());
    }

    #[test]
    fn test_create_and_remove_map_to_kinds() {
        let created = FileSystemEvent::from_notify(notify_event(
            notify::EventKind::Create(CreateKind::File),
            &["/a/new"],
        ));
        assert_eq!(created, vec![FileSystemEvent::new(EventKind::Created, "/a/new")]);

        let deleted = FileSystemEvent::from_notify(notify_event(
            notify::EventKind::Remove(RemoveKind::Any),
            &["/a/old"],
        ));
        assert_eq!(deleted, vec![FileSystemEvent::new(EventKind::Deleted, "/a/old")]);
    }

    #[test]
    fn test_rename_both_becomes_move() {
        let events = FileSystemEvent::from_notify(notify_event(
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/a/from", "/a/to"],
        ));
        assert_eq!(events, vec![FileSystemEvent::moved("/a/from", "/a/to")]);
        assert_eq!(
            events[0].touched_paths(),
            vec![Path::new("/a/from"), Path::new("/a/to")]
        );
    }

    #[test]
    fn test_content_change_is_modification() {
        let events = FileSystemEvent::from_notify(notify_event(
            notify::EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/a/file"],
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Modified);
        assert!(!events[0].is_synthetic);
    }

    #[test]
    fn test_synthetic_event() {
        let event = FileSystemEvent::synthetic("/workspace/src/main.rs");
        assert_eq!(event.kind, EventKind::Modified);
        assert!(event.is_synthetic);
        assert_eq!(event.touched_paths(), vec![Path::new("/workspace/src/main.rs")]);
    }
}
