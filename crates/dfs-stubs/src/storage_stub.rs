//! Storage-node stub traits and mock implementations.
//!
//! A storage node exposes two interfaces: the client (data) interface used by
//! end clients after `get_storage` resolves a file, and the command
//! (administrative) interface the naming server drives to create, delete and
//! copy files. Each stub reports the [`Address`] it talks to; two stubs with
//! the same address are the same remote interface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dfs_types::status_code::StorageCode;
use dfs_types::{make_error_msg, Address, Path, Result};
use parking_lot::Mutex;

/// Client-side stub for the storage node's data interface.
#[async_trait]
pub trait IStorageClientStub: Send + Sync {
    fn address(&self) -> Address;
    async fn size(&self, path: &Path) -> Result<u64>;
    async fn read(&self, path: &Path, offset: u64, length: u32) -> Result<Vec<u8>>;
    async fn write(&self, path: &Path, offset: u64, data: Vec<u8>) -> Result<()>;
}

/// Client-side stub for the storage node's command interface.
#[async_trait]
pub trait IStorageCommandStub: Send + Sync {
    fn address(&self) -> Address;

    /// Create an empty file. `Ok(false)` if the node refused.
    async fn create(&self, path: &Path) -> Result<bool>;

    /// Delete a file or a whole directory. `Ok(false)` if nothing was deleted.
    async fn delete(&self, path: &Path) -> Result<bool>;

    /// Fetch `path` from `source` and store it locally, replacing any copy.
    async fn copy(&self, path: &Path, source: Arc<dyn IStorageClientStub>) -> Result<bool>;
}

#[async_trait]
impl<T: IStorageClientStub + ?Sized> IStorageClientStub for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }
    async fn size(&self, path: &Path) -> Result<u64> {
        (**self).size(path).await
    }
    async fn read(&self, path: &Path, offset: u64, length: u32) -> Result<Vec<u8>> {
        (**self).read(path, offset, length).await
    }
    async fn write(&self, path: &Path, offset: u64, data: Vec<u8>) -> Result<()> {
        (**self).write(path, offset, data).await
    }
}

#[async_trait]
impl<T: IStorageCommandStub + ?Sized> IStorageCommandStub for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }
    async fn create(&self, path: &Path) -> Result<bool> {
        (**self).create(path).await
    }
    async fn delete(&self, path: &Path) -> Result<bool> {
        (**self).delete(path).await
    }
    async fn copy(&self, path: &Path, source: Arc<dyn IStorageClientStub>) -> Result<bool> {
        (**self).copy(path, source).await
    }
}

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

/// An in-memory data interface holding whole files as byte vectors.
pub struct MockStorageClientStub {
    address: Address,
    files: Mutex<HashMap<Path, Vec<u8>>>,
}

impl MockStorageClientStub {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Seed a file's contents.
    pub fn put(&self, path: Path, data: impl Into<Vec<u8>>) {
        self.files.lock().insert(path, data.into());
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }
}

#[async_trait]
impl IStorageClientStub for MockStorageClientStub {
    fn address(&self) -> Address {
        self.address
    }

    async fn size(&self, path: &Path) -> Result<u64> {
        match self.files.lock().get(path) {
            Some(data) => Ok(data.len() as u64),
            None => make_error_msg(StorageCode::FILE_NOT_FOUND, path.to_string()),
        }
    }

    async fn read(&self, path: &Path, offset: u64, length: u32) -> Result<Vec<u8>> {
        let files = self.files.lock();
        let Some(data) = files.get(path) else {
            return make_error_msg(StorageCode::FILE_NOT_FOUND, path.to_string());
        };
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(length as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write(&self, path: &Path, offset: u64, data: Vec<u8>) -> Result<()> {
        let mut files = self.files.lock();
        let Some(file) = files.get_mut(path) else {
            return make_error_msg(StorageCode::FILE_NOT_FOUND, path.to_string());
        };
        let offset = offset as usize;
        if file.len() < offset + data.len() {
            file.resize(offset + data.len(), 0);
        }
        file[offset..offset + data.len()].copy_from_slice(&data);
        Ok(())
    }
}

/// One call observed by [`MockStorageCommandStub`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandCall {
    Create(Path),
    Delete(Path),
    Copy { path: Path, source: Address },
}

type Handler<Args> = Box<dyn Fn(Args) -> Result<bool> + Send + Sync>;

/// A configurable command-interface mock.
///
/// Every call is recorded. Without a handler each call succeeds with `true`.
pub struct MockStorageCommandStub {
    address: Address,
    calls: Mutex<Vec<CommandCall>>,
    create_handler: Mutex<Option<Handler<Path>>>,
    delete_handler: Mutex<Option<Handler<Path>>>,
    copy_handler: Mutex<Option<Handler<(Path, Address)>>>,
}

impl MockStorageCommandStub {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            calls: Mutex::new(Vec::new()),
            create_handler: Mutex::new(None),
            delete_handler: Mutex::new(None),
            copy_handler: Mutex::new(None),
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn on_create(&self, f: impl Fn(Path) -> Result<bool> + Send + Sync + 'static) {
        *self.create_handler.lock() = Some(Box::new(f));
    }

    pub fn on_delete(&self, f: impl Fn(Path) -> Result<bool> + Send + Sync + 'static) {
        *self.delete_handler.lock() = Some(Box::new(f));
    }

    pub fn on_copy(&self, f: impl Fn((Path, Address)) -> Result<bool> + Send + Sync + 'static) {
        *self.copy_handler.lock() = Some(Box::new(f));
    }

    /// Snapshot of every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<CommandCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn dispatch<A>(&self, handler: &Mutex<Option<Handler<A>>>, args: A) -> Result<bool> {
        match handler.lock().as_ref() {
            Some(f) => f(args),
            None => Ok(true),
        }
    }
}

#[async_trait]
impl IStorageCommandStub for MockStorageCommandStub {
    fn address(&self) -> Address {
        self.address
    }

    async fn create(&self, path: &Path) -> Result<bool> {
        self.calls.lock().push(CommandCall::Create(path.clone()));
        self.dispatch(&self.create_handler, path.clone())
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        self.calls.lock().push(CommandCall::Delete(path.clone()));
        self.dispatch(&self.delete_handler, path.clone())
    }

    async fn copy(&self, path: &Path, source: Arc<dyn IStorageClientStub>) -> Result<bool> {
        let source = source.address();
        self.calls.lock().push(CommandCall::Copy {
            path: path.clone(),
            source,
        });
        self.dispatch(&self.copy_handler, (path.clone(), source))
    }
}
