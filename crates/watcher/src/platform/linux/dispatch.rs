//! Translation of raw inotify records into events
//!
//! Everything here is independent of the kernel: records arrive already
//! decoded, and watches go through a [`WatchRegistrar`]. The event loop feeds
//! one read cycle at a time so that the two halves of a rename, which the
//! kernel tags with a shared cookie, can be paired.

use crate::tree::{DirectoryTree, NodeId, WatchRegistrar};
use sentinel_core::{Event, WatchError};
use std::collections::HashMap;
use std::io;
use tracing::{debug, trace, warn};

/// What a record reports, reduced to what the dispatcher acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Create,
    Delete,
    Modify,
    MovedFrom,
    MovedTo,
    /// The watched directory itself was deleted or moved
    SelfRemoved,
    /// The kernel released the watch
    Ignored,
}

/// One decoded inotify record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord<W> {
    pub watch: W,
    pub kind: RecordKind,
    pub cookie: u32,
    pub name: Option<String>,
    pub is_dir: bool,
}

impl<W> RawRecord<W> {
    pub fn new(watch: W, kind: RecordKind, name: &str) -> Self {
        Self {
            watch,
            kind,
            cookie: 0,
            name: Some(name.to_string()),
            is_dir: false,
        }
    }

    pub fn dir(mut self) -> Self {
        self.is_dir = true;
        self
    }

    pub fn cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }
}

/// Outcome of one read cycle
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Events in kernel order, renames at the position of their first half
    pub events: Vec<Event>,
    /// Error that ends the watch; records after it were not looked at
    pub fatal: Option<WatchError>,
    /// Failures to extend the watch to new directories
    pub errors: Vec<WatchError>,
}

enum Slot {
    Ready { event: Event, is_dir: bool },
    /// First half of a rename, still waiting for its partner
    Departed {
        directory: String,
        name: String,
        is_dir: bool,
    },
}

impl Slot {
    fn finish(self, emit_files: bool) -> Option<Event> {
        let (event, is_dir) = match self {
            Slot::Ready { event, is_dir } => (event, is_dir),
            // Moved out of the watched tree
            Slot::Departed {
                directory,
                name,
                is_dir,
            } => (Event::deleted(directory, name), is_dir),
        };
        (is_dir || emit_files).then_some(event)
    }
}

/// Owns the directory tree and keeps it in step with incoming records
pub struct Dispatcher<R: WatchRegistrar> {
    tree: DirectoryTree<R::Id>,
    registrar: R,
}

impl<R: WatchRegistrar> Dispatcher<R> {
    pub fn new(tree: DirectoryTree<R::Id>, registrar: R) -> Self {
        Self { tree, registrar }
    }

    pub fn tree(&self) -> &DirectoryTree<R::Id> {
        &self.tree
    }

    pub fn registrar(&self) -> &R {
        &self.registrar
    }

    /// Translate one read cycle
    ///
    /// With `emit_files` unset only directory events are produced; the tree
    /// is updated either way.
    pub fn dispatch<I>(&mut self, records: I, emit_files: bool) -> Dispatched
    where
        I: IntoIterator<Item = RawRecord<R::Id>>,
    {
        let mut slots = Vec::new();
        let mut departed: HashMap<u32, usize> = HashMap::new();
        let mut outcome = Dispatched::default();

        for record in records {
            let Some(node) = self.tree.lookup(&record.watch) else {
                trace!("Dropping record for released watch {:?}", record.watch);
                continue;
            };

            match record.kind {
                RecordKind::Ignored => {
                    self.tree.forget_watch(&record.watch);
                    continue;
                }
                RecordKind::SelfRemoved => {
                    if node == self.tree.root() {
                        let root = self.tree.get(node).map(|n| n.path().to_path_buf());
                        outcome.fatal = Some(WatchError::RootRemoved(root.unwrap_or_default()));
                        break;
                    }
                    // The parent's own record takes care of the subtree
                    continue;
                }
                _ => {}
            }

            let Some(name) = record.name else {
                continue;
            };
            let Some(directory) = self.tree.get(node).map(|n| n.canonical_path().to_string())
            else {
                continue;
            };

            match record.kind {
                RecordKind::Create => {
                    if record.is_dir {
                        self.watch_directory(node, &name, &mut outcome.errors);
                    }
                    slots.push(Slot::Ready {
                        event: Event::created(directory, name),
                        is_dir: record.is_dir,
                    });
                }
                RecordKind::Delete => {
                    if record.is_dir {
                        self.tree.remove_child(node, &name, &mut self.registrar);
                    }
                    slots.push(Slot::Ready {
                        event: Event::deleted(directory, name),
                        is_dir: record.is_dir,
                    });
                }
                RecordKind::Modify => slots.push(Slot::Ready {
                    event: Event::modified(directory, name),
                    is_dir: record.is_dir,
                }),
                RecordKind::MovedFrom => {
                    if record.is_dir {
                        self.tree.remove_child(node, &name, &mut self.registrar);
                    }
                    departed.insert(record.cookie, slots.len());
                    slots.push(Slot::Departed {
                        directory,
                        name,
                        is_dir: record.is_dir,
                    });
                }
                RecordKind::MovedTo => {
                    if record.is_dir {
                        self.watch_directory(node, &name, &mut outcome.errors);
                    }
                    let position = departed.remove(&record.cookie);
                    let renamed = position.and_then(|index| match &slots[index] {
                        Slot::Departed {
                            directory: from,
                            name: old,
                            ..
                        } if *from == directory => Some((index, old.clone())),
                        _ => None,
                    });

                    match renamed {
                        Some((index, old)) => {
                            slots[index] = Slot::Ready {
                                event: Event::renamed(directory, old, name),
                                is_dir: record.is_dir,
                            };
                        }
                        // Moved in from outside, or across directories: the
                        // departed half (if any) turns into a deletion.
                        None => slots.push(Slot::Ready {
                            event: Event::created(directory, name),
                            is_dir: record.is_dir,
                        }),
                    }
                }
                RecordKind::Ignored | RecordKind::SelfRemoved => {}
            }
        }

        outcome.events = slots
            .into_iter()
            .filter_map(|slot| slot.finish(emit_files))
            .collect();
        outcome
    }

    /// Release every remaining watch
    pub fn shutdown(mut self) -> io::Result<()> {
        let root = self.tree.root();
        self.tree.destroy_tree(root, &mut self.registrar)
    }

    fn watch_directory(&mut self, parent: NodeId, name: &str, errors: &mut Vec<WatchError>) {
        match self.tree.insert_child(parent, name, &mut self.registrar) {
            Ok(_) => {}
            // Already gone again; its deletion record follows
            Err(WatchError::NotFound(path)) => {
                debug!("New directory {} vanished before it was watched", path.display());
            }
            Err(err) => {
                warn!("Failed to watch new directory {}: {}", name, err);
                errors.push(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testing::FakeRegistrar;
    use sentinel_core::event::canonical_path;
    use sentinel_core::Action;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Dispatcher<FakeRegistrar>) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::create_dir(dir.path().join("c")).unwrap();

        let mut registrar = FakeRegistrar::default();
        let tree = DirectoryTree::build(dir.path(), &mut registrar).unwrap();
        (dir, Dispatcher::new(tree, registrar))
    }

    fn wd(dispatcher: &Dispatcher<FakeRegistrar>, path: &Path) -> u32 {
        dispatcher.registrar().id_of(path).unwrap()
    }

    fn canonical(path: &Path) -> String {
        canonical_path(path)
    }

    #[test]
    fn test_plain_records() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());
        let a = wd(&dispatcher, &dir.path().join("a"));

        let out = dispatcher.dispatch(
            vec![
                RawRecord::new(root, RecordKind::Create, "x.txt"),
                RawRecord::new(a, RecordKind::Modify, "y.txt"),
                RawRecord::new(root, RecordKind::Delete, "x.txt"),
            ],
            true,
        );

        assert!(out.fatal.is_none());
        assert_eq!(
            out.events,
            vec![
                Event::created(canonical(dir.path()), "x.txt"),
                Event::modified(canonical(&dir.path().join("a")), "y.txt"),
                Event::deleted(canonical(dir.path()), "x.txt"),
            ]
        );
    }

    #[test]
    fn test_rename_in_same_directory() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());

        let out = dispatcher.dispatch(
            vec![
                RawRecord::new(root, RecordKind::MovedFrom, "a.txt").cookie(7),
                RawRecord::new(root, RecordKind::Modify, "other"),
                RawRecord::new(root, RecordKind::MovedTo, "b.txt").cookie(7),
            ],
            true,
        );

        // The rename keeps the position of its first half
        assert_eq!(out.events.len(), 2);
        assert_eq!(
            out.events[0],
            Event::renamed(canonical(dir.path()), "a.txt", "b.txt")
        );
        assert_eq!(out.events[1].action(), Action::Modified);
    }

    #[test]
    fn test_unpaired_halves() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());

        let out = dispatcher.dispatch(
            vec![
                RawRecord::new(root, RecordKind::MovedFrom, "gone").cookie(1),
                RawRecord::new(root, RecordKind::MovedTo, "arrived").cookie(2),
            ],
            true,
        );

        assert_eq!(
            out.events,
            vec![
                Event::deleted(canonical(dir.path()), "gone"),
                Event::created(canonical(dir.path()), "arrived"),
            ]
        );
    }

    #[test]
    fn test_cross_directory_move_degrades() {
        let (dir, mut dispatcher) = setup();
        let a = wd(&dispatcher, &dir.path().join("a"));
        let c = wd(&dispatcher, &dir.path().join("c"));

        let out = dispatcher.dispatch(
            vec![
                RawRecord::new(a, RecordKind::MovedFrom, "f").cookie(3),
                RawRecord::new(c, RecordKind::MovedTo, "f").cookie(3),
            ],
            true,
        );

        assert_eq!(
            out.events,
            vec![
                Event::deleted(canonical(&dir.path().join("a")), "f"),
                Event::created(canonical(&dir.path().join("c")), "f"),
            ]
        );
    }

    #[test]
    fn test_new_directory_is_watched() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());
        fs::create_dir_all(dir.path().join("d/e")).unwrap();

        let out = dispatcher.dispatch(
            vec![RawRecord::new(root, RecordKind::Create, "d").dir()],
            true,
        );
        assert_eq!(out.events, vec![Event::created(canonical(dir.path()), "d")]);

        // Records from the fresh watch now resolve
        let e = wd(&dispatcher, &dir.path().join("d/e"));
        let out = dispatcher.dispatch(vec![RawRecord::new(e, RecordKind::Create, "f")], true);
        assert_eq!(
            out.events,
            vec![Event::created(canonical(&dir.path().join("d/e")), "f")]
        );
    }

    #[test]
    fn test_deleted_directory_is_released() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());
        let b = wd(&dispatcher, &dir.path().join("a/b"));
        let before = dispatcher.tree().watch_count();

        let out = dispatcher.dispatch(
            vec![RawRecord::new(root, RecordKind::Delete, "a").dir()],
            true,
        );
        assert_eq!(out.events, vec![Event::deleted(canonical(dir.path()), "a")]);
        assert_eq!(dispatcher.tree().watch_count(), before - 2);

        // Late records for the released subtree are dropped
        let out = dispatcher.dispatch(vec![RawRecord::new(b, RecordKind::Modify, "z")], true);
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_directory_rename_moves_watches() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());
        fs::rename(dir.path().join("a"), dir.path().join("moved")).unwrap();

        let out = dispatcher.dispatch(
            vec![
                RawRecord::new(root, RecordKind::MovedFrom, "a").dir().cookie(9),
                RawRecord::new(root, RecordKind::MovedTo, "moved").dir().cookie(9),
            ],
            true,
        );

        assert_eq!(
            out.events,
            vec![Event::renamed(canonical(dir.path()), "a", "moved")]
        );
        let tree = dispatcher.tree();
        assert!(tree.child(tree.root(), "a").is_none());
        let moved = tree.child(tree.root(), "moved").unwrap();
        assert!(tree.child(moved, "b").is_some());
    }

    #[test]
    fn test_file_events_suppressed() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());
        fs::create_dir(dir.path().join("d")).unwrap();

        let out = dispatcher.dispatch(
            vec![
                RawRecord::new(root, RecordKind::Create, "file.txt"),
                RawRecord::new(root, RecordKind::Create, "d").dir(),
                RawRecord::new(root, RecordKind::MovedFrom, "old.txt").cookie(4),
            ],
            false,
        );

        assert_eq!(out.events, vec![Event::created(canonical(dir.path()), "d")]);
        // Directory bookkeeping happens even while suppressed
        let tree = dispatcher.tree();
        assert!(tree.child(tree.root(), "d").is_some());
    }

    #[test]
    fn test_root_removal_is_fatal() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());
        let c = wd(&dispatcher, &dir.path().join("c"));

        let mut self_removed = RawRecord::new(root, RecordKind::SelfRemoved, "");
        self_removed.name = None;
        let mut child_removed = RawRecord::new(c, RecordKind::SelfRemoved, "");
        child_removed.name = None;

        let out = dispatcher.dispatch(
            vec![
                child_removed,
                RawRecord::new(root, RecordKind::Delete, "c").dir(),
                self_removed,
                RawRecord::new(root, RecordKind::Create, "never"),
            ],
            true,
        );

        assert_eq!(out.events, vec![Event::deleted(canonical(dir.path()), "c")]);
        assert!(matches!(out.fatal, Some(WatchError::RootRemoved(_))));
    }

    #[test]
    fn test_ignored_forgets_watch() {
        let (dir, mut dispatcher) = setup();
        let c = wd(&dispatcher, &dir.path().join("c"));
        let before = dispatcher.tree().watch_count();

        let mut ignored = RawRecord::new(c, RecordKind::Ignored, "");
        ignored.name = None;
        let out = dispatcher.dispatch(vec![ignored], true);

        assert!(out.events.is_empty());
        assert_eq!(dispatcher.tree().watch_count(), before - 1);
    }

    #[test]
    fn test_watch_failure_is_reported_not_fatal() {
        let (dir, mut dispatcher) = setup();
        let root = wd(&dispatcher, dir.path());
        fs::create_dir(dir.path().join("locked")).unwrap();
        dispatcher.registrar.reject.insert(dir.path().join("locked"));

        let out = dispatcher.dispatch(
            vec![RawRecord::new(root, RecordKind::Create, "locked").dir()],
            true,
        );

        assert!(out.fatal.is_none());
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.events.len(), 1);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (_dir, dispatcher) = setup();
        let watches = dispatcher.tree().watch_count();
        assert_eq!(watches, 4);

        let registrar_view = dispatcher.registrar().active.len();
        assert_eq!(registrar_view, watches);
        assert!(dispatcher.shutdown().is_ok());
    }
}
