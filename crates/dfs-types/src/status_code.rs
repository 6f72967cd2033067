/// Status code type alias, a plain `u16` so codes cross process boundaries as-is.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const INVALID_ARG: status_code_t = 3;
    pub const QUEUE_FULL: status_code_t = 6;
    pub const INTERRUPTED: status_code_t = 27;
}

/// RPC status codes (2xxx), reported by storage-node stubs.
pub mod RPCCode {
    use super::status_code_t;

    pub const TIMEOUT: status_code_t = 2005;
    pub const SEND_FAILED: status_code_t = 2007;
    pub const CONNECT_FAILED: status_code_t = 2014;
}

/// Naming service status codes (3xxx).
pub mod NamingCode {
    use super::status_code_t;

    pub const NOT_FOUND: status_code_t = 3000;
    pub const NOT_DIRECTORY: status_code_t = 3003;
    pub const IS_DIRECTORY: status_code_t = 3006;
    pub const EXISTS: status_code_t = 3007;
    pub const CONFLICT: status_code_t = 3008;
    pub const UNAVAILABLE: status_code_t = 3009;
    pub const NOT_FILE: status_code_t = 3010;
    pub const REQUEST_CANCELED: status_code_t = 3018;
    pub const NOT_LOCKED: status_code_t = 3101;
    pub const FOUND_BUG: status_code_t = 3999;
}

/// Storage node status codes (4xxx).
pub mod StorageCode {
    use super::status_code_t;

    pub const REMOTE_FAILURE: status_code_t = 4000;
    pub const FILE_NOT_FOUND: status_code_t = 4001;
    pub const CREATE_FAILED: status_code_t = 4010;
}

/// Classification of status code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCodeType {
    Invalid = -1,
    Common = 0,
    RPC = 2,
    Naming = 3,
    Storage = 4,
}

/// Determine the type/category of a status code.
pub fn type_of(code: status_code_t) -> StatusCodeType {
    match code {
        0..=999 => StatusCodeType::Common,
        2000..=2999 => StatusCodeType::RPC,
        3000..=3999 => StatusCodeType::Naming,
        4000..=4999 => StatusCodeType::Storage,
        _ => StatusCodeType::Invalid,
    }
}

/// Whether a failure originated on the far side of a storage-node call.
///
/// Both transport errors and storage-side refusals count: the naming server
/// cannot tell a lost reply from a failed operation.
pub fn is_remote_failure(code: status_code_t) -> bool {
    matches!(type_of(code), StatusCodeType::RPC | StatusCodeType::Storage)
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        // Common
        StatusCode::OK => "OK",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::QUEUE_FULL => "QueueFull",
        StatusCode::INTERRUPTED => "Interrupted",

        // RPC
        RPCCode::TIMEOUT => "RPC::Timeout",
        RPCCode::SEND_FAILED => "RPC::SendFailed",
        RPCCode::CONNECT_FAILED => "RPC::ConnectFailed",

        // Naming
        NamingCode::NOT_FOUND => "Naming::NotFound",
        NamingCode::NOT_DIRECTORY => "Naming::NotDirectory",
        NamingCode::IS_DIRECTORY => "Naming::IsDirectory",
        NamingCode::EXISTS => "Naming::Exists",
        NamingCode::CONFLICT => "Naming::Conflict",
        NamingCode::UNAVAILABLE => "Naming::Unavailable",
        NamingCode::NOT_FILE => "Naming::NotFile",
        NamingCode::REQUEST_CANCELED => "Naming::RequestCanceled",
        NamingCode::NOT_LOCKED => "Naming::NotLocked",
        NamingCode::FOUND_BUG => "Naming::FoundBug",

        // Storage
        StorageCode::REMOTE_FAILURE => "Storage::RemoteFailure",
        StorageCode::FILE_NOT_FOUND => "Storage::FileNotFound",
        StorageCode::CREATE_FAILED => "Storage::CreateFailed",

        _ => "UnknownStatusCode",
    }
}
