//! Shared vocabulary of the naming server: status codes, the `Status` error
//! type, strongly-typed ids, endpoint addresses and namespace paths.

#[allow(non_snake_case)]
pub mod status_code;

pub mod status;
pub mod result;

#[macro_use]
pub mod ids;

pub mod address;
pub mod path;

// Re-export commonly used items at the crate root.
pub use address::{Address, AddressType};
pub use ids::{ClientId, InodeId, StorageId};
pub use path::{Path, PathParseError};
pub use result::{Result, make_error, make_error_msg};
pub use status::Status;
pub use status_code::*;
