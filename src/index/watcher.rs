//! File-system watcher built on `notify`, translating raw OS events into
//! [`ChangeEvent`]s on the bounded queue.

use super::events::{ChangeEvent, ChangeKind, EventSink};
use crate::chunker::languages;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Keeps the underlying OS watchers alive; dropping it stops watching.
pub struct ChangeWatcher {
    watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl ChangeWatcher {
    pub fn new(sink: EventSink) -> Result<Self, notify::Error> {
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in translate(&event) {
                        sink.push(change);
                    }
                }
                Err(e) => error!("watcher error: {e}"),
            },
            Config::default(),
        )?;
        Ok(Self {
            watcher,
            roots: Vec::new(),
        })
    }

    pub fn watch(&mut self, root: &Path) -> Result<(), notify::Error> {
        self.watcher.watch(root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "watching for changes");
        self.roots.push(root.to_path_buf());
        Ok(())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// Map one raw notification to zero or more change events, dropping paths
/// with no indexable extension. Rename notifications arrive either paired
/// (from + to) or as separate halves depending on the platform backend.
fn translate(event: &Event) -> Vec<ChangeEvent> {
    match &event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                if languages::is_indexable(to) {
                    return vec![ChangeEvent::now(
                        to.clone(),
                        ChangeKind::Renamed { from: from.clone() },
                    )];
                }
                // Renamed to something we don't index: just drop the old entry.
                if languages::is_indexable(from) {
                    return vec![ChangeEvent::now(from.clone(), ChangeKind::Deleted)];
                }
            }
            Vec::new()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            indexable_events(event, ChangeKind::Deleted)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            indexable_events(event, ChangeKind::Created)
        }
        EventKind::Create(_) => indexable_events(event, ChangeKind::Created),
        EventKind::Modify(_) => indexable_events(event, ChangeKind::Modified),
        EventKind::Remove(_) => indexable_events(event, ChangeKind::Deleted),
        _ => Vec::new(),
    }
}

fn indexable_events(event: &Event, kind: ChangeKind) -> Vec<ChangeEvent> {
    event
        .paths
        .iter()
        .filter(|p| languages::is_indexable(p))
        .map(|p| ChangeEvent::now(p.clone(), kind.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;

    fn raw(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_create_translates_to_created() {
        let events = translate(&raw(EventKind::Create(CreateKind::File), &["src/main.rs"]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Created);
        assert_eq!(events[0].path, PathBuf::from("src/main.rs"));
    }

    #[test]
    fn test_non_indexable_paths_are_dropped() {
        let events = translate(&raw(
            EventKind::Create(CreateKind::File),
            &["target/debug/build.lock", "notes.txt"],
        ));
        assert!(events.is_empty());
    }

    #[test]
    fn test_paired_rename_translates_to_renamed() {
        let events = translate(&raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["old.py", "new.py"],
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            ChangeKind::Renamed {
                from: PathBuf::from("old.py")
            }
        );
        assert_eq!(events[0].path, PathBuf::from("new.py"));
    }

    #[test]
    fn test_rename_to_unindexable_deletes_old_path() {
        let events = translate(&raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["keep.rs", "keep.rs.bak"],
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
        assert_eq!(events[0].path, PathBuf::from("keep.rs"));
    }

    #[test]
    fn test_remove_translates_to_deleted() {
        let events = translate(&raw(
            EventKind::Remove(notify::event::RemoveKind::File),
            &["gone.go"],
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
    }
}
