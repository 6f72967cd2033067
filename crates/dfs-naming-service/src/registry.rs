//! Registered storage nodes and replica placement.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dfs_stubs::{IStorageClientStub, IStorageCommandStub};
use dfs_types::status_code::NamingCode;
use dfs_types::{make_error_msg, Path, Result, StorageId};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

/// Handles for one registered storage node.
#[derive(Clone)]
pub struct StorageNode {
    pub id: StorageId,
    pub client: Arc<dyn IStorageClientStub>,
    pub command: Arc<dyn IStorageCommandStub>,
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("id", &self.id)
            .field("client", &self.client.address())
            .field("command", &self.command.address())
            .finish()
    }
}

struct StorageRecord {
    node: StorageNode,
    /// Files the naming server believes this node holds.
    hosted: BTreeSet<Path>,
}

/// Every storage node that has registered, keyed by id.
#[derive(Default)]
pub struct StorageRegistry {
    records: Mutex<BTreeMap<StorageId, StorageRecord>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Admit a storage node.
    ///
    /// Fails with `CONFLICT` if the id or either interface address is
    /// already registered; nothing is recorded in that case.
    pub fn add(
        &self,
        id: StorageId,
        client: Arc<dyn IStorageClientStub>,
        command: Arc<dyn IStorageCommandStub>,
    ) -> Result<StorageNode> {
        let mut records = self.records.lock();
        if records.contains_key(&id) {
            return make_error_msg(NamingCode::CONFLICT, format!("{} is already registered", id));
        }
        let (client_addr, command_addr) = (client.address(), command.address());
        if let Some(existing) = records.values().find(|r| {
            r.node.client.address() == client_addr || r.node.command.address() == command_addr
        }) {
            return make_error_msg(
                NamingCode::CONFLICT,
                format!(
                    "{} / {} already registered as {}",
                    client_addr, command_addr, existing.node.id
                ),
            );
        }
        let node = StorageNode {
            id,
            client,
            command,
        };
        records.insert(
            id,
            StorageRecord {
                node: node.clone(),
                hosted: BTreeSet::new(),
            },
        );
        Ok(node)
    }

    /// Forget a node and the files recorded on it. Returns `false` if it was
    /// not registered.
    pub fn remove(&self, id: StorageId) -> bool {
        self.records.lock().remove(&id).is_some()
    }

    pub fn get(&self, id: StorageId) -> Option<StorageNode> {
        self.records.lock().get(&id).map(|r| r.node.clone())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<StorageId> {
        self.records.lock().keys().copied().collect()
    }

    /// Pick the node a new file is created on, uniformly at random.
    pub fn choose_for_new_file(&self) -> Result<StorageNode> {
        let records = self.records.lock();
        let candidates: Vec<&StorageRecord> = records.values().collect();
        let mut rng = rand::thread_rng();
        match candidates.choose(&mut rng) {
            Some(record) => Ok(record.node.clone()),
            None => make_error_msg(NamingCode::UNAVAILABLE, "no storage node is registered"),
        }
    }

    /// Pick a node to receive another replica, avoiding the current `hosts`.
    pub fn choose_replica_target(&self, hosts: &[StorageId]) -> Option<StorageNode> {
        let records = self.records.lock();
        let candidates: Vec<&StorageRecord> = records
            .values()
            .filter(|r| !hosts.contains(&r.node.id))
            .collect();
        let mut rng = rand::thread_rng();
        candidates.choose(&mut rng).map(|r| r.node.clone())
    }

    /// The data interface clients should use for a file hosted on `hosts`:
    /// the first host that is registered.
    pub fn read_target(&self, hosts: &[StorageId]) -> Option<Arc<dyn IStorageClientStub>> {
        let records = self.records.lock();
        hosts
            .iter()
            .find_map(|id| records.get(id))
            .map(|r| r.node.client.clone())
    }

    pub fn record_hosted(&self, id: StorageId, path: Path) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.hosted.insert(path);
        }
    }

    pub fn forget_hosted(&self, id: StorageId, path: &Path) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.hosted.remove(path);
        }
    }

    /// Files recorded on a node, sorted.
    pub fn hosted_paths(&self, id: StorageId) -> Vec<Path> {
        self.records
            .lock()
            .get(&id)
            .map(|r| r.hosted.iter().cloned().collect())
            .unwrap_or_default()
    }
}
