//! Client-side stubs for the storage-node interfaces the naming server
//! consumes.
//!
//! Real implementations live with the RPC transport; this crate defines the
//! traits and provides mocks that are useful for unit testing without a
//! running storage node.

pub mod storage_stub;

pub use storage_stub::{
    CommandCall, IStorageClientStub, IStorageCommandStub, MockStorageClientStub,
    MockStorageCommandStub,
};
