/// Status code type. Replies carry these verbatim from the server.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const DATA_CORRUPTION: status_code_t = 2;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const NOT_ENOUGH_MEMORY: status_code_t = 26;
    pub const INTERRUPTED: status_code_t = 27;
    pub const INVALID_FORMAT: status_code_t = 33;
    pub const IO_ERROR: status_code_t = 69;
    pub const CONFIG_PARSE_ERROR: status_code_t = 71;
    pub const OS_ERROR: status_code_t = 72;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// Transport and protocol status codes (2xxx).
pub mod RPCCode {
    use super::status_code_t;

    pub const CONNECT_FAILED: status_code_t = 2000;
    pub const CONNECTION_CLOSED: status_code_t = 2001;
    pub const SEND_FAILED: status_code_t = 2002;
    pub const RECEIVE_FAILED: status_code_t = 2003;
    pub const TIMEOUT: status_code_t = 2005;
    /// Malformed or unexpected reply (wrong type, bad size, bad position).
    pub const BAD_DATA: status_code_t = 2010;
    /// The share is not (or no longer) connected to its server.
    pub const NOT_CONNECTED: status_code_t = 2011;
    pub const INVALID_MESSAGE: status_code_t = 2012;
    pub const SHUTTING_DOWN: status_code_t = 2013;
}

/// Filesystem status codes (3xxx), the ones a VFS caller gets to see.
pub mod FsCode {
    use super::status_code_t;

    pub const ENTRY_NOT_FOUND: status_code_t = 3000;
    pub const PERMISSION_DENIED: status_code_t = 3001;
    pub const NOT_ALLOWED: status_code_t = 3002;
    pub const BAD_VALUE: status_code_t = 3003;
    pub const NOT_A_DIRECTORY: status_code_t = 3004;
    pub const IS_A_DIRECTORY: status_code_t = 3005;
    pub const NAME_TOO_LONG: status_code_t = 3006;
    pub const BUFFER_OVERFLOW: status_code_t = 3007;
    pub const NOT_SUPPORTED: status_code_t = 3008;
    pub const EXISTS: status_code_t = 3009;
    pub const BUSY: status_code_t = 3010;
    pub const DIRECTORY_NOT_EMPTY: status_code_t = 3011;
    pub const NO_MORE_IDS: status_code_t = 3012;
    pub const READ_ONLY: status_code_t = 3013;
}

/// Server discovery and share status codes (4xxx).
pub mod ServerCode {
    use super::status_code_t;

    pub const BAD_SERVER_INFO: status_code_t = 4000;
    pub const SERVER_UNKNOWN: status_code_t = 4001;
    pub const NO_SUCH_SHARE: status_code_t = 4002;
    pub const AUTHENTICATION_CANCELLED: status_code_t = 4003;
    pub const AUTHENTICATION_FAILED: status_code_t = 4004;
    pub const BAD_DATAGRAM: status_code_t = 4005;
}

/// Classification of status code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCodeType {
    Invalid = -1,
    Common = 0,
    RPC = 2,
    Fs = 3,
    Server = 4,
}

/// Determine the category of a status code.
pub fn type_of(code: status_code_t) -> StatusCodeType {
    match code {
        0..=999 => StatusCodeType::Common,
        2000..=2999 => StatusCodeType::RPC,
        3000..=3999 => StatusCodeType::Fs,
        4000..=4999 => StatusCodeType::Server,
        _ => StatusCodeType::Invalid,
    }
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::DATA_CORRUPTION => "DataCorruption",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::NOT_ENOUGH_MEMORY => "NotEnoughMemory",
        StatusCode::INTERRUPTED => "Interrupted",
        StatusCode::INVALID_FORMAT => "InvalidFormat",
        StatusCode::IO_ERROR => "IOError",
        StatusCode::CONFIG_PARSE_ERROR => "ConfigParseError",
        StatusCode::OS_ERROR => "OSError",
        StatusCode::FOUND_BUG => "FoundBug",
        StatusCode::UNKNOWN => "Unknown",

        RPCCode::CONNECT_FAILED => "RPC::ConnectFailed",
        RPCCode::CONNECTION_CLOSED => "RPC::ConnectionClosed",
        RPCCode::SEND_FAILED => "RPC::SendFailed",
        RPCCode::RECEIVE_FAILED => "RPC::ReceiveFailed",
        RPCCode::TIMEOUT => "RPC::Timeout",
        RPCCode::BAD_DATA => "RPC::BadData",
        RPCCode::NOT_CONNECTED => "RPC::NotConnected",
        RPCCode::INVALID_MESSAGE => "RPC::InvalidMessage",
        RPCCode::SHUTTING_DOWN => "RPC::ShuttingDown",

        FsCode::ENTRY_NOT_FOUND => "Fs::EntryNotFound",
        FsCode::PERMISSION_DENIED => "Fs::PermissionDenied",
        FsCode::NOT_ALLOWED => "Fs::NotAllowed",
        FsCode::BAD_VALUE => "Fs::BadValue",
        FsCode::NOT_A_DIRECTORY => "Fs::NotADirectory",
        FsCode::IS_A_DIRECTORY => "Fs::IsADirectory",
        FsCode::NAME_TOO_LONG => "Fs::NameTooLong",
        FsCode::BUFFER_OVERFLOW => "Fs::BufferOverflow",
        FsCode::NOT_SUPPORTED => "Fs::NotSupported",
        FsCode::EXISTS => "Fs::Exists",
        FsCode::BUSY => "Fs::Busy",
        FsCode::DIRECTORY_NOT_EMPTY => "Fs::DirectoryNotEmpty",
        FsCode::NO_MORE_IDS => "Fs::NoMoreIds",
        FsCode::READ_ONLY => "Fs::ReadOnly",

        ServerCode::BAD_SERVER_INFO => "Server::BadServerInfo",
        ServerCode::SERVER_UNKNOWN => "Server::ServerUnknown",
        ServerCode::NO_SUCH_SHARE => "Server::NoSuchShare",
        ServerCode::AUTHENTICATION_CANCELLED => "Server::AuthenticationCancelled",
        ServerCode::AUTHENTICATION_FAILED => "Server::AuthenticationFailed",
        ServerCode::BAD_DATAGRAM => "Server::BadDatagram",

        _ => "UnknownStatusCode",
    }
}

/// Map a status code to the errno a host VFS should report.
pub fn to_errno(code: status_code_t) -> i32 {
    match code {
        StatusCode::INVALID_ARG | FsCode::BAD_VALUE => libc::EINVAL,
        StatusCode::NOT_IMPLEMENTED => libc::ENOSYS,
        StatusCode::NOT_ENOUGH_MEMORY | FsCode::NO_MORE_IDS => libc::ENOMEM,
        StatusCode::INTERRUPTED => libc::EINTR,
        FsCode::ENTRY_NOT_FOUND | ServerCode::NO_SUCH_SHARE => libc::ENOENT,
        FsCode::PERMISSION_DENIED
        | ServerCode::AUTHENTICATION_CANCELLED
        | ServerCode::AUTHENTICATION_FAILED => libc::EACCES,
        FsCode::NOT_ALLOWED => libc::EPERM,
        FsCode::NOT_A_DIRECTORY => libc::ENOTDIR,
        FsCode::IS_A_DIRECTORY => libc::EISDIR,
        FsCode::NAME_TOO_LONG => libc::ENAMETOOLONG,
        FsCode::BUFFER_OVERFLOW => libc::EOVERFLOW,
        FsCode::NOT_SUPPORTED => libc::EOPNOTSUPP,
        FsCode::EXISTS => libc::EEXIST,
        FsCode::BUSY => libc::EBUSY,
        FsCode::DIRECTORY_NOT_EMPTY => libc::ENOTEMPTY,
        FsCode::READ_ONLY => libc::EROFS,
        RPCCode::NOT_CONNECTED | RPCCode::CONNECTION_CLOSED => libc::ENOTCONN,
        RPCCode::TIMEOUT => libc::ETIMEDOUT,
        RPCCode::CONNECT_FAILED => libc::ECONNREFUSED,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::OK, 0);
        assert_eq!(StatusCode::UNKNOWN, 999);
        assert_eq!(RPCCode::CONNECT_FAILED, 2000);
        assert_eq!(FsCode::ENTRY_NOT_FOUND, 3000);
        assert_eq!(ServerCode::BAD_SERVER_INFO, 4000);
    }

    #[test]
    fn test_type_of() {
        assert_eq!(type_of(StatusCode::OK), StatusCodeType::Common);
        assert_eq!(type_of(RPCCode::NOT_CONNECTED), StatusCodeType::RPC);
        assert_eq!(type_of(FsCode::NOT_ALLOWED), StatusCodeType::Fs);
        assert_eq!(type_of(ServerCode::NO_SUCH_SHARE), StatusCodeType::Server);
        assert_eq!(type_of(1500), StatusCodeType::Invalid);
        assert_eq!(type_of(65535), StatusCodeType::Invalid);
    }

    #[test]
    fn test_to_string() {
        assert_eq!(to_string(StatusCode::OK), "OK");
        assert_eq!(to_string(RPCCode::BAD_DATA), "RPC::BadData");
        assert_eq!(to_string(FsCode::ENTRY_NOT_FOUND), "Fs::EntryNotFound");
        assert_eq!(to_string(ServerCode::BAD_DATAGRAM), "Server::BadDatagram");
        assert_eq!(to_string(12345), "UnknownStatusCode");
    }

    #[test]
    fn test_to_errno() {
        assert_eq!(to_errno(FsCode::ENTRY_NOT_FOUND), libc::ENOENT);
        assert_eq!(to_errno(FsCode::PERMISSION_DENIED), libc::EACCES);
        assert_eq!(to_errno(RPCCode::NOT_CONNECTED), libc::ENOTCONN);
        assert_eq!(to_errno(RPCCode::BAD_DATA), libc::EIO);
        assert_eq!(to_errno(StatusCode::OK), libc::EIO);
    }
}
