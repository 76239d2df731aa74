//! Live mirror of a watched directory hierarchy
//!
//! Per-directory facilities (inotify) report changes against a watch id, not
//! a path. The tree maps those ids back to directories and keeps exactly one
//! registration per live directory as directories come and go.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]: a parent
//! owns its children through the arena, a child only remembers its parent's
//! index.

use sentinel_core::event::canonical_path;
use sentinel_core::WatchError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Index of a node in the arena
pub type NodeId = usize;

/// Registers and releases native watches
///
/// Implemented over the kernel facility by each backend, and by an
/// in-memory fake in tests.
pub trait WatchRegistrar {
    /// Native watch identifier
    type Id: Clone + Eq + Hash + fmt::Debug;

    /// Register a watch on the directory at `path`
    fn add_watch(&mut self, path: &Path) -> Result<Self::Id, WatchError>;

    /// Release a watch; fails if the kernel already dropped it
    fn remove_watch(&mut self, id: Self::Id) -> io::Result<()>;
}

/// One watched directory
#[derive(Debug)]
pub struct DirectoryNode<W> {
    name: String,
    path: PathBuf,
    canonical: String,
    watch: Option<W>,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
}

impl<W> DirectoryNode<W> {
    fn new(name: String, path: PathBuf, parent: Option<NodeId>) -> Self {
        let canonical = canonical_path(&path);
        Self {
            name,
            path,
            canonical,
            watch: None,
            parent,
            children: BTreeMap::new(),
        }
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path in canonical event form
    pub fn canonical_path(&self) -> &str {
        &self.canonical
    }

    pub fn watch(&self) -> Option<&W> {
        self.watch.as_ref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(name, id)| (name.as_str(), *id))
    }
}

/// Arena of [`DirectoryNode`]s plus the reverse watch index
#[derive(Debug)]
pub struct DirectoryTree<W> {
    nodes: Vec<Option<DirectoryNode<W>>>,
    free: Vec<NodeId>,
    index: HashMap<W, NodeId>,
    root: NodeId,
}

impl<W> DirectoryTree<W>
where
    W: Clone + Eq + Hash + fmt::Debug,
{
    /// Mirror every directory under `root`, registering one watch per directory
    ///
    /// On failure every watch registered so far is released before the error
    /// is returned.
    pub fn build<R>(root: &Path, registrar: &mut R) -> Result<Self, WatchError>
    where
        R: WatchRegistrar<Id = W>,
    {
        let metadata = std::fs::metadata(root).map_err(|e| WatchError::from_io(&e, root))?;
        if !metadata.is_dir() {
            return Err(WatchError::NotADirectory(root.to_path_buf()));
        }

        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut tree = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            root: 0,
        };
        tree.root = tree.alloc(DirectoryNode::new(name, root.to_path_buf(), None));

        if let Err(err) = tree.populate(tree.root, registrar) {
            tree.destroy_watch_tree(tree.root, registrar);
            return Err(err);
        }

        debug!(
            "Built directory tree for {} ({} directories)",
            root.display(),
            tree.len()
        );
        Ok(tree)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&DirectoryNode<W>> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    /// Resolve a watch id to its directory
    pub fn lookup(&self, watch: &W) -> Option<NodeId> {
        self.index.get(watch).copied()
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.get(parent)
            .and_then(|node| node.children.get(name))
            .copied()
    }

    /// Find the node for `path`, which must lie under the root
    pub fn find(&self, path: &Path) -> Option<NodeId> {
        let root = self.get(self.root)?;
        let relative = path.strip_prefix(&root.path).ok()?;
        relative.components().try_fold(self.root, |id, component| {
            self.child(id, &component.as_os_str().to_string_lossy())
        })
    }

    /// Number of live directories
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.get(self.root).is_none()
    }

    /// Number of active watch registrations
    pub fn watch_count(&self) -> usize {
        self.index.len()
    }

    /// Add a directory that appeared under `parent`, with watches on everything
    /// already inside it
    ///
    /// A directory that is already known is returned as is. On failure the
    /// partially built subtree is torn down again.
    pub fn insert_child<R>(
        &mut self,
        parent: NodeId,
        name: &str,
        registrar: &mut R,
    ) -> Result<NodeId, WatchError>
    where
        R: WatchRegistrar<Id = W>,
    {
        if let Some(existing) = self.child(parent, name) {
            return Ok(existing);
        }
        let path = match self.get(parent) {
            Some(node) => node.path.join(name),
            None => return Err(WatchError::NotFound(PathBuf::from(name))),
        };

        let id = self.attach(parent, name.to_string(), path);
        if let Err(err) = self.populate(id, registrar) {
            self.destroy_watch_tree(id, registrar);
            return Err(err);
        }
        if let Some(node) = self.get(id) {
            debug!("Watching new directory {}", node.path.display());
        }
        Ok(id)
    }

    /// Drop the subtree for `name` under `parent`; returns whether it existed
    ///
    /// The directory is already gone on disk, so stale watches are tolerated.
    pub fn remove_child<R>(&mut self, parent: NodeId, name: &str, registrar: &mut R) -> bool
    where
        R: WatchRegistrar<Id = W>,
    {
        match self.child(parent, name) {
            Some(id) => {
                self.destroy_watch_tree(id, registrar);
                true
            }
            None => false,
        }
    }

    /// The kernel dropped `watch` on its own; stop tracking it
    pub fn forget_watch(&mut self, watch: &W) -> Option<NodeId> {
        let id = self.index.remove(watch)?;
        if let Some(Some(node)) = self.nodes.get_mut(id) {
            node.watch = None;
        }
        Some(id)
    }

    /// Release every watch in the subtree depth-first and free its nodes
    ///
    /// Keeps going after a failed release and returns the first failure.
    pub fn destroy_tree<R>(&mut self, id: NodeId, registrar: &mut R) -> io::Result<()>
    where
        R: WatchRegistrar<Id = W>,
    {
        let mut first = None;
        self.teardown(id, registrar, &mut |err| {
            first.get_or_insert(err);
        });
        first.map_or(Ok(()), Err)
    }

    /// Like [`destroy_tree`](Self::destroy_tree), for entities already gone
    /// from disk: releases that fail because the watch is invalid are ignored
    pub fn destroy_watch_tree<R>(&mut self, id: NodeId, registrar: &mut R)
    where
        R: WatchRegistrar<Id = W>,
    {
        self.teardown(id, registrar, &mut |err| {
            trace!("Watch already released: {}", err);
        });
    }

    fn teardown<R>(&mut self, id: NodeId, registrar: &mut R, on_error: &mut dyn FnMut(io::Error))
    where
        R: WatchRegistrar<Id = W>,
    {
        let Some(node) = self.get(id) else {
            return;
        };
        if let Some(parent) = node.parent {
            let name = node.name.clone();
            if let Some(Some(parent)) = self.nodes.get_mut(parent) {
                parent.children.remove(&name);
            }
        }

        // Reversed pre-order releases children before their parents
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            order.push(next);
            if let Some(node) = self.get(next) {
                stack.extend(node.children.values().copied());
            }
        }

        for node_id in order.into_iter().rev() {
            let Some(node) = self.nodes.get_mut(node_id).and_then(Option::take) else {
                continue;
            };
            if let Some(watch) = node.watch {
                self.index.remove(&watch);
                if let Err(err) = registrar.remove_watch(watch) {
                    on_error(err);
                }
            }
            self.free.push(node_id);
        }
    }

    fn alloc(&mut self, node: DirectoryNode<W>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn attach(&mut self, parent: NodeId, name: String, path: PathBuf) -> NodeId {
        let id = self.alloc(DirectoryNode::new(name.clone(), path, Some(parent)));
        if let Some(Some(parent)) = self.nodes.get_mut(parent) {
            parent.children.insert(name, id);
        }
        id
    }

    fn register<R>(&mut self, id: NodeId, registrar: &mut R) -> Result<(), WatchError>
    where
        R: WatchRegistrar<Id = W>,
    {
        let Some(path) = self.get(id).map(|node| node.path.clone()) else {
            return Ok(());
        };
        let watch = registrar.add_watch(&path)?;
        if self.index.contains_key(&watch) {
            // Same directory reachable twice (bind mount); one node owns the watch
            debug!("{} shares an existing watch, not tracking twice", path.display());
            return Ok(());
        }
        self.index.insert(watch.clone(), id);
        if let Some(Some(node)) = self.nodes.get_mut(id) {
            node.watch = Some(watch);
        }
        Ok(())
    }

    /// Register `top` and every directory below it
    fn populate<R>(&mut self, top: NodeId, registrar: &mut R) -> Result<(), WatchError>
    where
        R: WatchRegistrar<Id = W>,
    {
        self.register(top, registrar)?;
        let Some(top_path) = self.get(top).map(|node| node.path.clone()) else {
            return Ok(());
        };

        let mut by_path = HashMap::new();
        by_path.insert(top_path.clone(), top);

        let walker = WalkDir::new(&top_path)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_type().is_dir());

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    // Entries can vanish between listing and stat
                    trace!("Skipping entry during tree build: {}", err);
                    continue;
                }
            };
            let Some(parent) = entry.path().parent().and_then(|p| by_path.get(p)).copied() else {
                continue;
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            let id = self.attach(parent, name, entry.path().to_path_buf());
            match self.register(id, registrar) {
                Ok(()) => {
                    by_path.insert(entry.into_path(), id);
                }
                Err(WatchError::NotFound(_)) => {
                    trace!("{} vanished before it could be watched", entry.path().display());
                    self.destroy_watch_tree(id, registrar);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;

    /// In-memory registrar handing out sequential ids
    #[derive(Debug, Default)]
    pub struct FakeRegistrar {
        next: u32,
        pub active: HashMap<u32, PathBuf>,
        pub released: Vec<PathBuf>,
        pub reject: HashSet<PathBuf>,
        pub limit: Option<usize>,
    }

    impl WatchRegistrar for FakeRegistrar {
        type Id = u32;

        fn add_watch(&mut self, path: &Path) -> Result<u32, WatchError> {
            if self.reject.contains(path) {
                return Err(WatchError::PermissionDenied(path.to_path_buf()));
            }
            if self.limit.is_some_and(|limit| self.active.len() >= limit) {
                return Err(WatchError::WatchLimitExceeded(path.to_path_buf()));
            }
            self.next += 1;
            self.active.insert(self.next, path.to_path_buf());
            Ok(self.next)
        }

        fn remove_watch(&mut self, id: u32) -> io::Result<()> {
            match self.active.remove(&id) {
                Some(path) => {
                    self.released.push(path);
                    Ok(())
                }
                None => Err(io::Error::from_raw_os_error(22)),
            }
        }
    }

    impl FakeRegistrar {
        pub fn id_of(&self, path: &Path) -> Option<u32> {
            self.active
                .iter()
                .find(|(_, p)| p.as_path() == path)
                .map(|(id, _)| *id)
        }
    }
}
