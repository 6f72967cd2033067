//! Hierarchical path locks.
//!
//! Every namespace node carries a [`NodeLock`]: a strict FIFO queue of
//! shared/exclusive requests. Locking a path takes SHARED on every proper
//! ancestor from the root down and then the requested mode on the target, so
//! an exclusive lock on a directory excludes its whole subtree. Release runs
//! in the opposite order.
//!
//! A shared lock on a directory does not freeze its child set: new children
//! are created under it through [`LockManager::create_locked`], and a child is
//! removed by whoever holds it exclusively. A request that was queued on a
//! node which is removed before the grant fails with `NOT_FOUND`.
//!
//! Grants are signalled through one-shot channels. A waiter that gives up
//! (its future is dropped, e.g. by a timeout) withdraws its request, or
//! releases it if the grant raced with the cancellation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dfs_types::status_code::NamingCode;
use dfs_types::{make_error_msg, ClientId, InodeId, Path, Result, StorageId};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::tree::{NamespaceTree, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

#[derive(Debug)]
struct Held {
    id: u64,
    owner: ClientId,
    mode: LockMode,
}

#[derive(Debug)]
struct Pending {
    id: u64,
    owner: ClientId,
    mode: LockMode,
    /// Taken exactly once, when the request is granted.
    signal: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct LockQueue {
    current: Vec<Held>,
    pending: VecDeque<Pending>,
}

impl LockQueue {
    fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.current.iter().all(|h| h.mode == LockMode::Shared),
            LockMode::Exclusive => self.current.is_empty(),
        }
    }

    /// Move requests from the head of the queue into the holder set while
    /// they are compatible with it. Nothing behind an incompatible head is
    /// granted, so a waiting writer is never overtaken by later readers.
    fn grant_ready(&mut self) -> Vec<oneshot::Sender<()>> {
        let mut signals = Vec::new();
        loop {
            match self.pending.front() {
                Some(head) if self.compatible(head.mode) => {}
                _ => break,
            }
            let Some(mut req) = self.pending.pop_front() else {
                break;
            };
            self.current.push(Held {
                id: req.id,
                owner: req.owner,
                mode: req.mode,
            });
            if let Some(tx) = req.signal.take() {
                signals.push(tx);
            }
        }
        signals
    }
}

fn fire(signals: Vec<oneshot::Sender<()>>) {
    for tx in signals {
        // A closed receiver means the waiter is cancelling; its drop guard
        // releases the grant.
        let _ = tx.send(());
    }
}

/// Lock queue of a single namespace node.
#[derive(Debug, Default)]
pub struct NodeLock {
    queue: Mutex<LockQueue>,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue whose first holder is already in place.
    fn held(id: u64, owner: ClientId, mode: LockMode) -> Self {
        let queue = LockQueue {
            current: vec![Held { id, owner, mode }],
            pending: VecDeque::new(),
        };
        Self {
            queue: Mutex::new(queue),
        }
    }

    /// Enqueue a request. The returned receiver completes once it is granted,
    /// immediately if the lock is free.
    fn request(&self, id: u64, owner: ClientId, mode: LockMode) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let signals = {
            let mut queue = self.queue.lock();
            queue.pending.push_back(Pending {
                id,
                owner,
                mode,
                signal: Some(tx),
            });
            queue.grant_ready()
        };
        fire(signals);
        rx
    }

    /// Release a granted request, or withdraw a pending one.
    fn release(&self, id: u64) {
        let signals = {
            let mut queue = self.queue.lock();
            if let Some(pos) = queue.current.iter().position(|h| h.id == id) {
                queue.current.swap_remove(pos);
            } else if let Some(pos) = queue.pending.iter().position(|p| p.id == id) {
                queue.pending.remove(pos);
            }
            queue.grant_ready()
        };
        fire(signals);
    }

    /// Current holders.
    pub fn holders(&self) -> Vec<(ClientId, LockMode)> {
        self.queue
            .lock()
            .current
            .iter()
            .map(|h| (h.owner, h.mode))
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        queue.current.is_empty() && queue.pending.is_empty()
    }
}

/// One granted request on one node.
#[derive(Debug)]
struct Grant {
    lock: Arc<NodeLock>,
    id: u64,
}

/// Withdraws a request if the waiting future is dropped before the grant is
/// handed to a [`PathLockGuard`].
struct Waiter {
    grant: Option<Grant>,
}

impl Waiter {
    fn disarm(mut self) -> Option<Grant> {
        self.grant.take()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(grant) = self.grant.take() {
            tracing::trace!(request = grant.id, "lock wait cancelled");
            grant.lock.release(grant.id);
        }
    }
}

/// A locked path. Dropping it releases the target first, then the ancestors
/// from the deepest up to the root.
#[derive(Debug)]
#[must_use = "the path is unlocked as soon as the guard is dropped"]
pub struct PathLockGuard {
    path: Path,
    owner: ClientId,
    mode: LockMode,
    target: InodeId,
    /// Root first, target last.
    grants: Vec<Grant>,
}

impl PathLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// The locked node.
    pub fn target(&self) -> InodeId {
        self.target
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        while let Some(grant) = self.grants.pop() {
            grant.lock.release(grant.id);
        }
    }
}

/// Acquires path locks and keeps the ones clients hold across calls.
pub struct LockManager {
    tree: Arc<NamespaceTree>,
    next_request: AtomicU64,
    client_locks: Mutex<HashMap<(ClientId, Path, LockMode), Vec<PathLockGuard>>>,
}

impl LockManager {
    pub fn new(tree: Arc<NamespaceTree>) -> Self {
        Self {
            tree,
            next_request: AtomicU64::new(1),
            client_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Lock `path` in `mode` for `owner`, waiting as long as it takes.
    ///
    /// Fails with `NOT_FOUND` before touching any lock if the path does not
    /// resolve, and also if a component is removed while the request waits.
    /// Either way no lock is left behind.
    pub async fn lock(&self, owner: ClientId, path: &Path, mode: LockMode) -> Result<PathLockGuard> {
        self.tree.lookup(path)?;

        let mut guard = PathLockGuard {
            path: path.clone(),
            owner,
            mode,
            target: InodeId::ROOT,
            grants: Vec::with_capacity(path.depth() + 1),
        };
        let mut node = InodeId::ROOT;
        for name in path.components() {
            self.acquire(&mut guard, node, owner, LockMode::Shared).await?;
            // A removed node has no children, so this also catches a removal
            // of `node` itself while we were queued on it.
            node = match self.tree.child(node, name) {
                Some(child) => child,
                None => return make_error_msg(NamingCode::NOT_FOUND, path.to_string()),
            };
        }
        self.acquire(&mut guard, node, owner, mode).await?;
        if !self.tree.contains(node) {
            return make_error_msg(NamingCode::NOT_FOUND, path.to_string());
        }
        guard.target = node;
        tracing::trace!(%owner, %path, %mode, "path locked");
        Ok(guard)
    }

    /// [`lock`](Self::lock) bounded by `timeout`. Expiry fails with
    /// `REQUEST_CANCELED` and withdraws every request made so far.
    pub async fn lock_with_timeout(
        &self,
        owner: ClientId,
        path: &Path,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<PathLockGuard> {
        let Some(timeout) = timeout else {
            return self.lock(owner, path, mode).await;
        };
        match tokio::time::timeout(timeout, self.lock(owner, path, mode)).await {
            Ok(res) => res,
            Err(_) => make_error_msg(
                NamingCode::REQUEST_CANCELED,
                format!("timed out waiting for {} lock on {}", mode, path),
            ),
        }
    }

    /// Create `name` in the directory `parent` has locked and return the new
    /// node locked EXCLUSIVE by the same owner, keeping `parent`'s locks as
    /// its ancestors.
    ///
    /// The node is inserted with its lock already held, so nobody else can
    /// lock it until the returned guard is dropped. Fails with `EXISTS` if
    /// the name is taken; `parent` is released on any error.
    pub fn create_locked(
        &self,
        mut parent: PathLockGuard,
        name: &str,
        kind: NodeKind,
        host: Option<StorageId>,
    ) -> Result<PathLockGuard> {
        let path = parent.path.child(name)?;
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let lock = Arc::new(NodeLock::held(id, parent.owner, LockMode::Exclusive));
        let node = self
            .tree
            .create_with_lock(parent.target, name, kind, host, lock.clone())?;
        parent.grants.push(Grant { lock, id });
        parent.path = path;
        parent.mode = LockMode::Exclusive;
        parent.target = node;
        Ok(parent)
    }

    async fn acquire(
        &self,
        guard: &mut PathLockGuard,
        node: InodeId,
        owner: ClientId,
        mode: LockMode,
    ) -> Result<()> {
        let lock = self.tree.node_lock(node)?;
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let granted = lock.request(id, owner, mode);
        let waiter = Waiter {
            grant: Some(Grant { lock, id }),
        };
        if granted.await.is_err() {
            return make_error_msg(NamingCode::FOUND_BUG, "lock request dropped without a grant");
        }
        if let Some(grant) = waiter.disarm() {
            guard.grants.push(grant);
        }
        Ok(())
    }

    /// Take a lock on behalf of a client and keep it until
    /// [`release_client_lock`](Self::release_client_lock). Returns the locked
    /// node.
    pub async fn acquire_client_lock(
        &self,
        owner: ClientId,
        path: &Path,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<InodeId> {
        let guard = self.lock_with_timeout(owner, path, mode, timeout).await?;
        let target = guard.target();
        self.client_locks
            .lock()
            .entry((owner, path.clone(), mode))
            .or_default()
            .push(guard);
        Ok(target)
    }

    /// Release one lock previously taken by
    /// [`acquire_client_lock`](Self::acquire_client_lock) with the same
    /// owner, path and mode. Fails with `NOT_LOCKED` if there is none.
    pub fn release_client_lock(&self, owner: ClientId, path: &Path, mode: LockMode) -> Result<()> {
        let guard = {
            let mut locks = self.client_locks.lock();
            let key = (owner, path.clone(), mode);
            let Some(held) = locks.get_mut(&key) else {
                return make_error_msg(
                    NamingCode::NOT_LOCKED,
                    format!("{} holds no {} lock on {}", owner, mode, path),
                );
            };
            let guard = held.pop();
            if held.is_empty() {
                locks.remove(&key);
            }
            guard
        };
        drop(guard);
        tracing::trace!(%owner, %path, %mode, "client lock released");
        Ok(())
    }

    /// Number of client-held locks currently outstanding.
    pub fn client_lock_count(&self) -> usize {
        self.client_locks.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::time::{sleep, timeout};

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    /// /a/b/f with f a file.
    fn setup() -> (Arc<NamespaceTree>, Arc<LockManager>) {
        let tree = Arc::new(NamespaceTree::new());
        let a = tree.create_directory(InodeId::ROOT, "a").unwrap();
        let b = tree.create_directory(a, "b").unwrap();
        tree.create_file(b, "f", StorageId(1)).unwrap();
        let locks = Arc::new(LockManager::new(tree.clone()));
        (tree, locks)
    }

    fn holders_at(tree: &NamespaceTree, path: &str) -> Vec<(ClientId, LockMode)> {
        let id = tree.lookup(&p(path)).unwrap();
        tree.node_lock(id).unwrap().holders()
    }

    fn all_idle(tree: &NamespaceTree) -> bool {
        ["/", "/a", "/a/b", "/a/b/f"].iter().all(|path| {
            let id = tree.lookup(&p(path)).unwrap();
            tree.node_lock(id).unwrap().is_idle()
        })
    }

    #[test]
    fn test_queue_grants_readers_together() {
        let lock = NodeLock::new();
        let mut r1 = lock.request(1, ClientId(1), LockMode::Shared);
        let mut r2 = lock.request(2, ClientId(2), LockMode::Shared);
        assert!(r1.try_recv().is_ok());
        assert!(r2.try_recv().is_ok());
        assert_eq!(lock.holders().len(), 2);
    }

    #[test]
    fn test_queue_writer_blocks_later_readers() {
        let lock = NodeLock::new();
        let mut r1 = lock.request(1, ClientId(1), LockMode::Shared);
        let mut w = lock.request(2, ClientId(2), LockMode::Exclusive);
        let mut r2 = lock.request(3, ClientId(3), LockMode::Shared);
        assert!(r1.try_recv().is_ok());
        assert!(w.try_recv().is_err());
        assert!(r2.try_recv().is_err());

        lock.release(1);
        assert!(w.try_recv().is_ok());
        assert!(r2.try_recv().is_err());

        lock.release(2);
        assert!(r2.try_recv().is_ok());
        assert_eq!(lock.holders(), vec![(ClientId(3), LockMode::Shared)]);
    }

    #[test]
    fn test_queue_shared_waits_for_exclusive_holder() {
        let lock = NodeLock::new();
        let mut w = lock.request(1, ClientId(1), LockMode::Exclusive);
        let mut r = lock.request(2, ClientId(2), LockMode::Shared);
        assert!(w.try_recv().is_ok());
        assert!(r.try_recv().is_err());
        lock.release(1);
        assert!(r.try_recv().is_ok());
    }

    #[test]
    fn test_withdrawing_pending_head_unblocks_queue() {
        let lock = NodeLock::new();
        let _r1 = lock.request(1, ClientId(1), LockMode::Shared);
        let _w = lock.request(2, ClientId(2), LockMode::Exclusive);
        let mut r2 = lock.request(3, ClientId(3), LockMode::Shared);
        assert!(r2.try_recv().is_err());

        lock.release(2);
        assert!(r2.try_recv().is_ok());
        assert_eq!(lock.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_lock_takes_shared_ancestors() {
        let (tree, locks) = setup();
        let guard = locks
            .lock(ClientId(7), &p("/a/b/f"), LockMode::Exclusive)
            .await
            .unwrap();
        assert_eq!(guard.target(), tree.lookup(&p("/a/b/f")).unwrap());
        assert_eq!(holders_at(&tree, "/"), vec![(ClientId(7), LockMode::Shared)]);
        assert_eq!(holders_at(&tree, "/a"), vec![(ClientId(7), LockMode::Shared)]);
        assert_eq!(holders_at(&tree, "/a/b"), vec![(ClientId(7), LockMode::Shared)]);
        assert_eq!(
            holders_at(&tree, "/a/b/f"),
            vec![(ClientId(7), LockMode::Exclusive)]
        );
        drop(guard);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_lock_root() {
        let (tree, locks) = setup();
        let guard = locks
            .lock(ClientId(1), &Path::root(), LockMode::Exclusive)
            .await
            .unwrap();
        assert_eq!(guard.target(), InodeId::ROOT);
        assert_eq!(holders_at(&tree, "/"), vec![(ClientId(1), LockMode::Exclusive)]);
        drop(guard);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_missing_path_takes_no_locks() {
        let (tree, locks) = setup();
        let err = locks
            .lock(ClientId(1), &p("/a/missing/x"), LockMode::Shared)
            .await
            .unwrap_err();
        assert_eq!(err.code(), NamingCode::NOT_FOUND);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_root_writer_waits_for_descendant_holders() {
        let (tree, locks) = setup();
        let root_writer = locks.clone();

        let guard = locks
            .lock(ClientId(1), &p("/a/b/f"), LockMode::Shared)
            .await
            .unwrap();

        // A root writer can only get in once everything below is released.
        let writer = tokio::spawn(async move {
            root_writer
                .lock(ClientId(2), &Path::root(), LockMode::Exclusive)
                .await
                .map(|g| g.target())
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        drop(guard);
        let target = writer.await.unwrap().unwrap();
        assert_eq!(target, InodeId::ROOT);
        assert!(all_idle(&tree));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_is_mutually_exclusive() {
        let (_tree, locks) = setup();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks
                    .lock(ClientId(i), &p("/a/b/f"), LockMode::Exclusive)
                    .await
                    .unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_holders_overlap() {
        let (_tree, locks) = setup();
        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let mut handles = Vec::new();
        for i in 0..4u64 {
            let locks = locks.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks
                    .lock(ClientId(i), &p("/a/b/f"), LockMode::Shared)
                    .await
                    .unwrap();
                // Only completes if all four hold the lock at once.
                barrier.wait().await;
            }));
        }
        for h in handles {
            timeout(Duration::from_secs(5), h).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_directory_exclusive_excludes_subtree() {
        let (_tree, locks) = setup();
        let dir = locks
            .lock(ClientId(1), &p("/a"), LockMode::Exclusive)
            .await
            .unwrap();

        let reader = locks.clone();
        let waiting = tokio::spawn(async move {
            reader
                .lock(ClientId(2), &p("/a/b/f"), LockMode::Shared)
                .await
                .map(|g| g.target())
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(dir);
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_waiting_writer_not_starved_by_readers() {
        let (_tree, locks) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks
            .lock(ClientId(1), &p("/a/b/f"), LockMode::Shared)
            .await
            .unwrap();

        let writer = {
            let locks = locks.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _g = locks
                    .lock(ClientId(2), &p("/a/b/f"), LockMode::Exclusive)
                    .await
                    .unwrap();
                order.lock().push("writer");
            })
        };
        sleep(Duration::from_millis(20)).await;

        let reader = {
            let locks = locks.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _g = locks
                    .lock(ClientId(3), &p("/a/b/f"), LockMode::Shared)
                    .await
                    .unwrap();
                order.lock().push("late reader");
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(order.lock().is_empty());

        drop(first);
        writer.await.unwrap();
        reader.await.unwrap();
        assert_eq!(*order.lock(), vec!["writer", "late reader"]);
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_cleans_up() {
        let (tree, locks) = setup();
        let holder = locks
            .lock(ClientId(1), &p("/a/b/f"), LockMode::Exclusive)
            .await
            .unwrap();

        let err = locks
            .lock_with_timeout(
                ClientId(2),
                &p("/a/b/f"),
                LockMode::Shared,
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), NamingCode::REQUEST_CANCELED);

        let f = tree.lookup(&p("/a/b/f")).unwrap();
        assert_eq!(tree.node_lock(f).unwrap().pending_len(), 0);
        assert_eq!(holders_at(&tree, "/a"), vec![(ClientId(1), LockMode::Shared)]);

        drop(holder);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_timeout_while_queued_on_ancestor() {
        let (tree, locks) = setup();
        let holder = locks
            .lock(ClientId(1), &p("/a"), LockMode::Exclusive)
            .await
            .unwrap();

        // Granted on "/", then stuck behind the writer on "/a".
        let err = locks
            .lock_with_timeout(
                ClientId(2),
                &p("/a/b/f"),
                LockMode::Exclusive,
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), NamingCode::REQUEST_CANCELED);

        let a = tree.lookup(&p("/a")).unwrap();
        assert_eq!(tree.node_lock(a).unwrap().pending_len(), 0);
        assert_eq!(holders_at(&tree, "/a"), vec![(ClientId(1), LockMode::Exclusive)]);
        assert_eq!(holders_at(&tree, "/"), vec![(ClientId(1), LockMode::Shared)]);
        assert!(holders_at(&tree, "/a/b").is_empty());

        drop(holder);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_target_removed_while_queued() {
        let (tree, locks) = setup();
        let writer = locks
            .lock(ClientId(1), &p("/a/b"), LockMode::Exclusive)
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .lock(ClientId(2), &p("/a/b"), LockMode::Shared)
                    .await
                    .map(|g| g.target())
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tree.remove(writer.target(), &p("/a/b")).unwrap();
        drop(writer);

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code(), NamingCode::NOT_FOUND);
        for path in ["/", "/a"] {
            let id = tree.lookup(&p(path)).unwrap();
            assert!(tree.node_lock(id).unwrap().is_idle());
        }
    }

    #[tokio::test]
    async fn test_create_locked_holds_new_node() {
        let (tree, locks) = setup();
        let parent = locks
            .lock(ClientId(3), &p("/a"), LockMode::Shared)
            .await
            .unwrap();
        let guard = locks
            .create_locked(parent, "n", NodeKind::File, Some(StorageId(2)))
            .unwrap();
        assert_eq!(guard.path(), &p("/a/n"));
        assert_eq!(guard.mode(), LockMode::Exclusive);
        assert_eq!(guard.target(), tree.lookup(&p("/a/n")).unwrap());
        assert_eq!(tree.hosts(guard.target()).unwrap(), vec![StorageId(2)]);
        assert_eq!(holders_at(&tree, "/a/n"), vec![(ClientId(3), LockMode::Exclusive)]);
        assert_eq!(holders_at(&tree, "/a"), vec![(ClientId(3), LockMode::Shared)]);

        // Readers of the new node wait for its creator.
        let reader = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .lock(ClientId(4), &p("/a/n"), LockMode::Shared)
                    .await
                    .map(|g| g.target())
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        let n = guard.target();
        drop(guard);
        assert_eq!(reader.await.unwrap().unwrap(), n);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_create_locked_name_taken_releases_parent() {
        let (tree, locks) = setup();
        let parent = locks
            .lock(ClientId(3), &p("/a"), LockMode::Shared)
            .await
            .unwrap();
        let err = locks
            .create_locked(parent, "b", NodeKind::Directory, None)
            .unwrap_err();
        assert_eq!(err.code(), NamingCode::EXISTS);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_creates_under_shared_parent_run_alongside_readers() {
        let (tree, locks) = setup();
        let reader = locks
            .lock(ClientId(1), &p("/a/b/f"), LockMode::Shared)
            .await
            .unwrap();
        let parent = timeout(
            Duration::from_secs(1),
            locks.lock(ClientId(2), &Path::root(), LockMode::Shared),
        )
        .await
        .unwrap()
        .unwrap();
        let created = locks
            .create_locked(parent, "x", NodeKind::Directory, None)
            .unwrap();
        assert_eq!(tree.kind(created.target()).unwrap(), NodeKind::Directory);
        drop(created);
        drop(reader);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_concurrent_delete_turns_wait_into_not_found() {
        let (tree, locks) = setup();
        let dir = locks
            .lock(ClientId(1), &p("/a"), LockMode::Exclusive)
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .lock(ClientId(2), &p("/a/b/f"), LockMode::Shared)
                    .await
                    .map(|g| g.target())
            })
        };
        sleep(Duration::from_millis(20)).await;

        let b = tree.lookup(&p("/a/b")).unwrap();
        tree.remove(b, &p("/a/b")).unwrap();
        drop(dir);

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code(), NamingCode::NOT_FOUND);
        for path in ["/", "/a"] {
            let id = tree.lookup(&p(path)).unwrap();
            assert!(tree.node_lock(id).unwrap().is_idle());
        }
    }

    #[tokio::test]
    async fn test_client_locks_unlock_and_idempotence() {
        let (tree, locks) = setup();
        let target = locks
            .acquire_client_lock(ClientId(5), &p("/a/b"), LockMode::Shared, None)
            .await
            .unwrap();
        assert_eq!(target, tree.lookup(&p("/a/b")).unwrap());
        assert_eq!(locks.client_lock_count(), 1);

        // Wrong mode or owner is not a match.
        let err = locks
            .release_client_lock(ClientId(5), &p("/a/b"), LockMode::Exclusive)
            .unwrap_err();
        assert_eq!(err.code(), NamingCode::NOT_LOCKED);
        assert!(locks
            .release_client_lock(ClientId(6), &p("/a/b"), LockMode::Shared)
            .is_err());

        locks
            .release_client_lock(ClientId(5), &p("/a/b"), LockMode::Shared)
            .unwrap();
        assert_eq!(locks.client_lock_count(), 0);
        assert!(all_idle(&tree));

        let err = locks
            .release_client_lock(ClientId(5), &p("/a/b"), LockMode::Shared)
            .unwrap_err();
        assert_eq!(err.code(), NamingCode::NOT_LOCKED);
        assert!(all_idle(&tree));
    }

    #[tokio::test]
    async fn test_client_can_stack_shared_locks() {
        let (tree, locks) = setup();
        for _ in 0..2 {
            locks
                .acquire_client_lock(ClientId(5), &p("/a"), LockMode::Shared, None)
                .await
                .unwrap();
        }
        assert_eq!(holders_at(&tree, "/a").len(), 2);
        locks
            .release_client_lock(ClientId(5), &p("/a"), LockMode::Shared)
            .unwrap();
        assert_eq!(holders_at(&tree, "/a").len(), 1);
        locks
            .release_client_lock(ClientId(5), &p("/a"), LockMode::Shared)
            .unwrap();
        assert!(all_idle(&tree));
    }
}
