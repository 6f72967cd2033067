//! Naming service implementation.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dfs_stubs::{IStorageClientStub, IStorageCommandStub};
use dfs_types::status_code::{NamingCode, StatusCode, StorageCode};
use dfs_types::{make_error_msg, ClientId, InodeId, Path, Result, Status, StorageId};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::NamingServiceConfig;
use crate::lock::{LockManager, LockMode, PathLockGuard};
use crate::registry::{StorageNode, StorageRegistry};
use crate::replication::{ReplicaContext, ReplicaTask, ReplicationCoordinator};
use crate::tree::{NamespaceTree, NodeKind};
use crate::{NamingService, Registration};

/// Concrete implementation of [`NamingService`] and [`Registration`].
pub struct NamingServiceImpl {
    config: NamingServiceConfig,
    tree: Arc<NamespaceTree>,
    locks: Arc<LockManager>,
    registry: Arc<StorageRegistry>,
    replication: ReplicationCoordinator,
}

impl NamingServiceImpl {
    /// Build the service with an empty namespace and start its replication
    /// dispatcher. Must be called from within a tokio runtime.
    pub fn new(config: NamingServiceConfig) -> Self {
        let tree = Arc::new(NamespaceTree::new());
        let locks = Arc::new(LockManager::new(tree.clone()));
        let registry = Arc::new(StorageRegistry::new());
        let replication = ReplicationCoordinator::start(
            ReplicaContext {
                tree: tree.clone(),
                locks: locks.clone(),
                registry: registry.clone(),
            },
            &config.replication,
        );
        Self {
            config,
            tree,
            locks,
            registry,
            replication,
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &NamingServiceConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<NamespaceTree> {
        &self.tree
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    pub fn replication(&self) -> &ReplicationCoordinator {
        &self.replication
    }

    /// Stop background replication.
    pub async fn shutdown(&self) {
        self.replication.shutdown().await;
    }

    async fn lock_path(&self, path: &Path, mode: LockMode) -> Result<PathLockGuard> {
        self.locks
            .lock_with_timeout(ClientId::SYSTEM, path, mode, self.config.lock_timeout)
            .await
    }

    /// Lock `parent` shared and check it is a directory. New children are
    /// then added through [`LockManager::create_locked`].
    async fn lock_parent(&self, parent: &Path) -> Result<PathLockGuard> {
        let guard = self.lock_path(parent, LockMode::Shared).await?;
        if self.tree.kind(guard.target())? != NodeKind::Directory {
            return make_error_msg(NamingCode::NOT_DIRECTORY, parent.to_string());
        }
        Ok(guard)
    }

    /// Update access accounting after a client lock on `target` and schedule
    /// replica work when it is due.
    fn on_client_grant(&self, path: &Path, target: InodeId, mode: LockMode) {
        let replication = &self.config.replication;
        if !replication.enabled {
            return;
        }
        if !matches!(self.tree.kind(target), Ok(NodeKind::File)) {
            return;
        }
        let task = match mode {
            LockMode::Shared => match self.tree.record_access(target, replication.read_threshold) {
                Ok(true) => self.primary_host(target).map(|source| ReplicaTask::Replicate {
                    path: path.clone(),
                    source,
                }),
                _ => None,
            },
            LockMode::Exclusive => {
                if let Err(status) = self.tree.reset_access(target) {
                    debug!(%path, "access count not reset: {}", status);
                }
                self.primary_host(target)
                    .map(|write_target| ReplicaTask::Invalidate {
                        path: path.clone(),
                        write_target,
                    })
            }
        };
        if let Some(task) = task {
            debug!(%path, ?task, "scheduling replica task");
            if let Err(status) = self.replication.schedule(task) {
                warn!(%path, "replica task not scheduled: {}", status);
            }
        }
    }

    /// Take back a registration that failed part way: drop the files already
    /// adopted for `node`, then the node itself, so the storage node can
    /// register again.
    async fn undo_registration(&self, node: &StorageNode, adopted: &[Path]) {
        for path in adopted {
            if let Err(status) = self.remove_adopted(path).await {
                warn!(storage = %node.id, %path, "adopted file left behind: {}", status);
            }
        }
        self.registry.remove(node.id);
    }

    async fn remove_adopted(&self, path: &Path) -> Result<()> {
        let guard = self.lock_path(path, LockMode::Exclusive).await?;
        self.tree.remove(guard.target(), path)?;
        Ok(())
    }

    fn primary_host(&self, target: InodeId) -> Option<StorageId> {
        self.tree.hosts(target).ok()?.first().copied()
    }

    /// Add one file reported by a registering storage node. Returns `false`
    /// if the path is a duplicate.
    async fn adopt_hosted_file(&self, node: &StorageNode, path: &Path) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        loop {
            let existing = self.tree.existing_prefix_len(path);
            if existing == path.depth() {
                return Ok(false);
            }
            let anchor = path.prefix(existing);
            // Shared is enough: `create_file_under` checks and inserts the
            // whole chain under one arena write.
            let guard = match self.lock_path(&anchor, LockMode::Shared).await {
                Ok(guard) => guard,
                // The anchor went away between planning and locking.
                Err(status) if status.code() == NamingCode::NOT_FOUND => continue,
                Err(status) => return Err(status),
            };
            let rest: Vec<&str> = path.components().skip(existing).collect();
            let created = self
                .tree
                .create_file_under(guard.target(), &rest, node.id)?;
            if created.is_some() {
                self.registry.record_hosted(node.id, path.clone());
            }
            return Ok(created.is_some());
        }
    }
}

#[async_trait]
impl NamingService for NamingServiceImpl {
    async fn is_directory(&self, path: &Path) -> Result<bool> {
        let guard = self.lock_path(path, LockMode::Shared).await?;
        Ok(self.tree.kind(guard.target())? == NodeKind::Directory)
    }

    async fn list(&self, path: &Path) -> Result<Vec<String>> {
        let guard = self.lock_path(path, LockMode::Shared).await?;
        self.tree.list(guard.target())
    }

    async fn create_file(&self, path: &Path) -> Result<bool> {
        let (Some(parent), Some(name)) = (path.parent(), path.last()) else {
            return Ok(false);
        };
        let guard = self.lock_parent(&parent).await?;
        if self.tree.child(guard.target(), name).is_some() {
            return Ok(false);
        }

        let storage = self.registry.choose_for_new_file()?;
        // The new node stays locked exclusively until the storage node has
        // answered; only its parent chain is held shared meanwhile.
        let guard = match self
            .locks
            .create_locked(guard, name, NodeKind::File, Some(storage.id))
        {
            Ok(guard) => guard,
            Err(status) if status.code() == NamingCode::EXISTS => return Ok(false),
            Err(status) => return Err(status),
        };

        let failure = match storage.command.create(path).await {
            Ok(true) => None,
            Ok(false) => Some(Status::with_message(
                StorageCode::CREATE_FAILED,
                format!("{} refused to create {}", storage.id, path),
            )),
            Err(status) => {
                warn!(%path, storage = %storage.id, "create failed: {}", status);
                Some(Status::with_message(
                    StorageCode::REMOTE_FAILURE,
                    format!("create {} on {}: {}", path, storage.id, status.describe()),
                ))
            }
        };
        if let Some(status) = failure {
            if let Err(err) = self.tree.remove(guard.target(), path) {
                warn!(%path, "failed create not rolled back: {}", err);
            }
            return Err(status);
        }

        self.registry.record_hosted(storage.id, path.clone());
        debug!(%path, storage = %storage.id, "file created");
        Ok(true)
    }

    async fn create_directory(&self, path: &Path) -> Result<bool> {
        let (Some(parent), Some(name)) = (path.parent(), path.last()) else {
            return Ok(false);
        };
        let guard = self.lock_parent(&parent).await?;
        match self
            .locks
            .create_locked(guard, name, NodeKind::Directory, None)
        {
            Ok(_created) => {
                debug!(%path, "directory created");
                Ok(true)
            }
            Err(status) if status.code() == NamingCode::EXISTS => Ok(false),
            Err(status) => Err(status),
        }
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        // EXCLUSIVE on the target covers its subtree; siblings stay usable.
        let guard = self.lock_path(path, LockMode::Exclusive).await?;

        // Storage nodes are told first, so a re-create of `path` cannot be
        // overtaken by the delete of the old file.
        let files = self.tree.files_under(guard.target(), path)?;
        let affected: BTreeSet<StorageId> = files
            .iter()
            .flat_map(|file| file.hosts.iter().copied())
            .collect();
        let deletions = affected
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .map(|node| async move { (node.id, node.command.delete(path).await) });
        for (storage, res) in join_all(deletions).await {
            match res {
                Ok(true) => {}
                Ok(false) => warn!(%path, %storage, "storage node deleted nothing"),
                Err(status) => warn!(%path, %storage, "storage delete failed: {}", status),
            }
        }

        let removed = self.tree.remove(guard.target(), path)?;
        for file in &removed {
            for host in &file.hosts {
                self.registry.forget_hosted(*host, &file.path);
            }
        }
        drop(guard);

        debug!(%path, files = removed.len(), "deleted");
        Ok(true)
    }

    async fn lock(&self, client: ClientId, path: &Path, exclusive: bool) -> Result<()> {
        let mode = LockMode::from_exclusive(exclusive);
        let target = self
            .locks
            .acquire_client_lock(client, path, mode, self.config.lock_timeout)
            .await?;
        self.on_client_grant(path, target, mode);
        Ok(())
    }

    async fn unlock(&self, client: ClientId, path: &Path, exclusive: bool) -> Result<()> {
        self.locks
            .release_client_lock(client, path, LockMode::from_exclusive(exclusive))
    }

    async fn get_storage(&self, path: &Path) -> Result<Arc<dyn IStorageClientStub>> {
        let guard = self.lock_path(path, LockMode::Shared).await?;
        if self.tree.kind(guard.target())? == NodeKind::Directory {
            return make_error_msg(NamingCode::IS_DIRECTORY, path.to_string());
        }
        let hosts = self.tree.hosts(guard.target())?;
        match self.registry.read_target(&hosts) {
            Some(client) => Ok(client),
            None => make_error_msg(
                NamingCode::UNAVAILABLE,
                format!("no registered host for {}", path),
            ),
        }
    }
}

#[async_trait]
impl Registration for NamingServiceImpl {
    async fn register(
        &self,
        id: StorageId,
        client: Option<Arc<dyn IStorageClientStub>>,
        command: Option<Arc<dyn IStorageCommandStub>>,
        files: Vec<Path>,
    ) -> Result<Vec<Path>> {
        let (Some(client), Some(command)) = (client, command) else {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                "registration needs both a client and a command handle",
            );
        };
        let node = self.registry.add(id, client, command)?;
        info!(
            storage = %id,
            client = %node.client.address(),
            command = %node.command.address(),
            files = files.len(),
            "storage node registered"
        );

        let mut adopted = Vec::new();
        let mut duplicates = Vec::new();
        for path in files {
            match self.adopt_hosted_file(&node, &path).await {
                Ok(true) => adopted.push(path),
                Ok(false) => duplicates.push(path),
                Err(status) => {
                    warn!(storage = %id, %path, "registration aborted: {}", status);
                    self.undo_registration(&node, &adopted).await;
                    return Err(status);
                }
            }
        }
        if !duplicates.is_empty() {
            debug!(storage = %id, count = duplicates.len(), "duplicate files reported");
        }
        Ok(duplicates)
    }
}
