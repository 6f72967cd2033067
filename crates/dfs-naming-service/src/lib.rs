//! Naming service core for the distributed file system.
//!
//! The naming server owns the directory namespace and decides which storage
//! node holds which file. Storage nodes only hold bytes.
//!
//! Architecture:
//! - [`tree::NamespaceTree`] - in-memory arena of files and directories
//! - [`lock::LockManager`] - hierarchical shared/exclusive path locks
//! - [`registry::StorageRegistry`] - registered storage nodes and placement
//! - [`replication::ReplicationCoordinator`] - background replicate/invalidate tasks
//! - [`NamingServiceImpl`] - composes the above behind [`NamingService`] and
//!   [`Registration`]

pub mod config;
pub mod lock;
pub mod registry;
pub mod replication;
pub mod service;
pub mod tree;

use std::sync::Arc;

use async_trait::async_trait;
use dfs_stubs::{IStorageClientStub, IStorageCommandStub};
use dfs_types::{ClientId, Path, Result, StorageId};

/// Operations clients perform against the namespace.
#[async_trait]
pub trait NamingService: Send + Sync {
    /// Whether `path` names a directory.
    async fn is_directory(&self, path: &Path) -> Result<bool>;

    /// Names of the entries in a directory, sorted.
    async fn list(&self, path: &Path) -> Result<Vec<String>>;

    /// Create an empty file on a storage node chosen by the server.
    /// `Ok(false)` if the path already exists or is the root.
    async fn create_file(&self, path: &Path) -> Result<bool>;

    /// `Ok(false)` if the path already exists or is the root.
    async fn create_directory(&self, path: &Path) -> Result<bool>;

    /// Remove a file or a directory with everything below it.
    async fn delete(&self, path: &Path) -> Result<bool>;

    /// Take a path lock that outlives the call, until the matching
    /// [`unlock`](Self::unlock).
    async fn lock(&self, client: ClientId, path: &Path, exclusive: bool) -> Result<()>;

    async fn unlock(&self, client: ClientId, path: &Path, exclusive: bool) -> Result<()>;

    /// The data interface of a storage node holding the file.
    async fn get_storage(&self, path: &Path) -> Result<Arc<dyn IStorageClientStub>>;
}

/// Called by storage nodes joining the system.
#[async_trait]
pub trait Registration: Send + Sync {
    /// Register a storage node together with the files it already holds.
    /// Returns the reported files the namespace already had.
    async fn register(
        &self,
        id: StorageId,
        client: Option<Arc<dyn IStorageClientStub>>,
        command: Option<Arc<dyn IStorageCommandStub>>,
        files: Vec<Path>,
    ) -> Result<Vec<Path>>;
}

pub use config::{ConfigError, NamingServerConfig, NamingServiceConfig, ReplicationConfig};
pub use lock::{LockManager, LockMode, PathLockGuard};
pub use registry::{StorageNode, StorageRegistry};
pub use replication::{
    ReplicaTask, ReplicationCoordinator, StatsSnapshot, TaskError, TaskOutcome, TaskReport,
};
pub use service::NamingServiceImpl;
pub use tree::{NamespaceTree, NodeKind};
