//! In-memory namespace tree.
//!
//! Nodes live in an arena keyed by [`InodeId`]; parent and child links are
//! ids, not pointers. Ids are handed out monotonically and never reused, so a
//! stale id held by a background task simply stops resolving once its node
//! is removed.
//!
//! The arena sits behind a short-lived `RwLock` that is never held across an
//! await. Every structural change (checking a name is free and inserting it,
//! detaching a subtree) happens under one write guard, so two creators racing
//! for the same name under a shared parent lock cannot both win. Which
//! operations may touch which part of the tree is decided by the path locks in
//! [`crate::lock`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dfs_types::status_code::NamingCode;
use dfs_types::{make_error_msg, InodeId, Path, Result, StorageId};
use parking_lot::RwLock;

use crate::lock::NodeLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    name: String,
    parent: Option<InodeId>,
    /// Sorted so listings come out in name order.
    children: BTreeMap<String, InodeId>,
    /// Storage nodes holding a replica, primary first. Always empty for
    /// directories.
    hosts: Vec<StorageId>,
    /// Read grants since the last replication decision.
    access_count: u64,
    lock: Arc<NodeLock>,
}

impl Node {
    fn new(kind: NodeKind, name: String, parent: Option<InodeId>, lock: Arc<NodeLock>) -> Self {
        Self {
            kind,
            name,
            parent,
            children: BTreeMap::new(),
            hosts: Vec::new(),
            access_count: 0,
            lock,
        }
    }
}

#[derive(Debug)]
struct Arena {
    nodes: HashMap<InodeId, Node>,
    next_id: u64,
}

impl Arena {
    fn node(&self, id: InodeId) -> Result<&Node> {
        match self.nodes.get(&id) {
            Some(node) => Ok(node),
            None => make_error_msg(NamingCode::NOT_FOUND, format!("{} no longer exists", id)),
        }
    }

    fn node_mut(&mut self, id: InodeId) -> Result<&mut Node> {
        match self.nodes.get_mut(&id) {
            Some(node) => Ok(node),
            None => make_error_msg(NamingCode::NOT_FOUND, format!("{} no longer exists", id)),
        }
    }

    fn file_mut(&mut self, id: InodeId) -> Result<&mut Node> {
        let node = self.node_mut(id)?;
        if node.kind != NodeKind::File {
            return make_error_msg(NamingCode::NOT_FILE, format!("{} is a directory", id));
        }
        Ok(node)
    }

    fn insert(
        &mut self,
        parent: InodeId,
        name: &str,
        kind: NodeKind,
        lock: Arc<NodeLock>,
    ) -> Result<InodeId> {
        let id = InodeId(self.next_id);
        let dir = self.node_mut(parent)?;
        if dir.kind != NodeKind::Directory {
            return make_error_msg(NamingCode::NOT_DIRECTORY, format!("{} is a file", parent));
        }
        if dir.children.contains_key(name) {
            return make_error_msg(NamingCode::EXISTS, name.to_string());
        }
        dir.children.insert(name.to_string(), id);
        self.nodes
            .insert(id, Node::new(kind, name.to_string(), Some(parent), lock));
        self.next_id += 1;
        Ok(id)
    }

    /// Files in the subtree rooted at `id`, sorted by path.
    fn files_under(&self, id: InodeId, path: &Path) -> Result<Vec<FileHosts>> {
        let mut files = Vec::new();
        let mut stack = vec![(id, path.clone())];
        while let Some((next, next_path)) = stack.pop() {
            let node = self.node(next)?;
            match node.kind {
                NodeKind::File => files.push(FileHosts {
                    path: next_path,
                    hosts: node.hosts.clone(),
                }),
                NodeKind::Directory => {
                    for (child_name, child) in &node.children {
                        stack.push((*child, next_path.child(child_name)?));
                    }
                }
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

/// A file in a subtree together with its replica holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHosts {
    pub path: Path,
    pub hosts: Vec<StorageId>,
}

/// The namespace: a tree of files and directories rooted at `/`.
#[derive(Debug)]
pub struct NamespaceTree {
    arena: RwLock<Arena>,
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceTree {
    /// Create a namespace holding only the root directory.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            InodeId::ROOT,
            Node::new(
                NodeKind::Directory,
                String::new(),
                None,
                Arc::new(NodeLock::new()),
            ),
        );
        Self {
            arena: RwLock::new(Arena {
                nodes,
                next_id: InodeId::ROOT.0 + 1,
            }),
        }
    }

    /// Number of nodes. Never zero: the root always exists.
    pub fn node_count(&self) -> usize {
        self.arena.read().nodes.len()
    }

    /// Resolve a path to its node.
    pub fn lookup(&self, path: &Path) -> Result<InodeId> {
        let arena = self.arena.read();
        let mut id = InodeId::ROOT;
        for name in path.components() {
            match arena.node(id)?.children.get(name) {
                Some(child) => id = *child,
                None => return make_error_msg(NamingCode::NOT_FOUND, path.to_string()),
            }
        }
        Ok(id)
    }

    /// How many leading components of `path` resolve to existing nodes.
    pub fn existing_prefix_len(&self, path: &Path) -> usize {
        let arena = self.arena.read();
        let mut id = InodeId::ROOT;
        let mut len = 0;
        for name in path.components() {
            let Some(child) = arena.nodes.get(&id).and_then(|n| n.children.get(name)) else {
                break;
            };
            id = *child;
            len += 1;
        }
        len
    }

    /// The child called `name` of directory `parent`, if both still exist.
    pub fn child(&self, parent: InodeId, name: &str) -> Option<InodeId> {
        let arena = self.arena.read();
        arena.nodes.get(&parent)?.children.get(name).copied()
    }

    pub fn contains(&self, id: InodeId) -> bool {
        self.arena.read().nodes.contains_key(&id)
    }

    pub fn kind(&self, id: InodeId) -> Result<NodeKind> {
        Ok(self.arena.read().node(id)?.kind)
    }

    pub fn name(&self, id: InodeId) -> Result<String> {
        Ok(self.arena.read().node(id)?.name.clone())
    }

    pub fn parent(&self, id: InodeId) -> Result<Option<InodeId>> {
        Ok(self.arena.read().node(id)?.parent)
    }

    /// The lock queue attached to a node.
    pub fn node_lock(&self, id: InodeId) -> Result<Arc<NodeLock>> {
        Ok(self.arena.read().node(id)?.lock.clone())
    }

    /// Create an empty directory under `parent`.
    pub fn create_directory(&self, parent: InodeId, name: &str) -> Result<InodeId> {
        self.create_with_lock(parent, name, NodeKind::Directory, None, Arc::default())
    }

    /// Create a file under `parent` hosted by `host`.
    pub fn create_file(&self, parent: InodeId, name: &str, host: StorageId) -> Result<InodeId> {
        self.create_with_lock(parent, name, NodeKind::File, Some(host), Arc::default())
    }

    /// Create a node that uses `lock` as its lock queue.
    ///
    /// The node becomes visible together with that queue, so a queue that is
    /// already held keeps everyone else out until its holder lets go. Fails
    /// with `EXISTS` if the name is taken and `NOT_DIRECTORY` under a file.
    pub fn create_with_lock(
        &self,
        parent: InodeId,
        name: &str,
        kind: NodeKind,
        host: Option<StorageId>,
        lock: Arc<NodeLock>,
    ) -> Result<InodeId> {
        let mut arena = self.arena.write();
        let id = arena.insert(parent, name, kind, lock)?;
        if let Some(host) = host {
            arena.node_mut(id)?.hosts.push(host);
        }
        Ok(id)
    }

    /// Create the file at `anchor/rest[0]/.../rest[n-1]`, creating missing
    /// intermediate directories, and host it on `host`.
    ///
    /// Returns `None` without changing anything if the file already exists or
    /// some component on the way is a file.
    pub fn create_file_under(
        &self,
        anchor: InodeId,
        rest: &[&str],
        host: StorageId,
    ) -> Result<Option<InodeId>> {
        let Some((file_name, dirs)) = rest.split_last() else {
            return Ok(None);
        };
        let mut arena = self.arena.write();

        // Dry run first so a conflict deep down leaves no directories behind.
        let mut id = anchor;
        let mut missing_from = None;
        for (i, name) in dirs.iter().enumerate() {
            let node = arena.node(id)?;
            if node.kind != NodeKind::Directory {
                return Ok(None);
            }
            match node.children.get(*name) {
                Some(child) => id = *child,
                None => {
                    missing_from = Some(i);
                    break;
                }
            }
        }
        if missing_from.is_none() {
            let node = arena.node(id)?;
            if node.kind != NodeKind::Directory || node.children.contains_key(*file_name) {
                return Ok(None);
            }
        }

        if let Some(start) = missing_from {
            for name in &dirs[start..] {
                id = arena.insert(id, name, NodeKind::Directory, Arc::default())?;
            }
        }
        let file = arena.insert(id, file_name, NodeKind::File, Arc::default())?;
        arena.node_mut(file)?.hosts.push(host);
        Ok(Some(file))
    }

    /// Files in the subtree rooted at `id` (just `id` for a file), sorted
    /// by path. `path` is the node's own path.
    pub fn files_under(&self, id: InodeId, path: &Path) -> Result<Vec<FileHosts>> {
        self.arena.read().files_under(id, path)
    }

    /// Remove a node and, for a directory, its whole subtree. Returns the
    /// files that were dropped, as [`files_under`](Self::files_under) would.
    pub fn remove(&self, id: InodeId, path: &Path) -> Result<Vec<FileHosts>> {
        if id.is_root() {
            return make_error_msg(NamingCode::FOUND_BUG, "the root cannot be removed");
        }
        let mut arena = self.arena.write();
        let files = arena.files_under(id, path)?;
        let node = arena.node(id)?;
        let parent = node.parent;
        let name = node.name.clone();

        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = arena.nodes.remove(&next) {
                stack.extend(node.children.into_values());
            }
        }
        if let Some(parent) = parent {
            if let Some(dir) = arena.nodes.get_mut(&parent) {
                dir.children.remove(&name);
            }
        }
        Ok(files)
    }

    /// Names of the immediate children of a directory, sorted.
    pub fn list(&self, id: InodeId) -> Result<Vec<String>> {
        let arena = self.arena.read();
        let node = arena.node(id)?;
        if node.kind != NodeKind::Directory {
            return make_error_msg(NamingCode::NOT_DIRECTORY, format!("{} is a file", id));
        }
        Ok(node.children.keys().cloned().collect())
    }

    /// Replica holders of a file, primary first.
    pub fn hosts(&self, id: InodeId) -> Result<Vec<StorageId>> {
        let arena = self.arena.read();
        let node = arena.node(id)?;
        if node.kind != NodeKind::File {
            return make_error_msg(NamingCode::NOT_FILE, format!("{} is a directory", id));
        }
        Ok(node.hosts.clone())
    }

    /// Record an additional replica. Returns `false` if it was already known.
    pub fn add_host(&self, id: InodeId, host: StorageId) -> Result<bool> {
        let mut arena = self.arena.write();
        let node = arena.file_mut(id)?;
        if node.hosts.contains(&host) {
            return Ok(false);
        }
        node.hosts.push(host);
        Ok(true)
    }

    /// Shrink the host set to exactly `{keep}`, returning the dropped hosts.
    pub fn retain_only_host(&self, id: InodeId, keep: StorageId) -> Result<Vec<StorageId>> {
        let mut arena = self.arena.write();
        let node = arena.file_mut(id)?;
        let dropped = node.hosts.iter().copied().filter(|h| *h != keep).collect();
        node.hosts = vec![keep];
        Ok(dropped)
    }

    /// Count one read access. Returns `true`, and restarts the count, when
    /// the count reaches `threshold`.
    pub fn record_access(&self, id: InodeId, threshold: u64) -> Result<bool> {
        let mut arena = self.arena.write();
        let node = arena.file_mut(id)?;
        node.access_count += 1;
        if node.access_count >= threshold {
            node.access_count = 0;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn reset_access(&self, id: InodeId) -> Result<()> {
        self.arena.write().file_mut(id)?.access_count = 0;
        Ok(())
    }

    pub fn access_count(&self, id: InodeId) -> Result<u64> {
        Ok(self.arena.read().node(id)?.access_count)
    }
}
