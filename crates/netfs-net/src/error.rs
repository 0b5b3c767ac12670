use netfs_types::{RPCCode, Status, StatusCode};
use thiserror::Error;

/// Errors raised below the request layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer closed the stream, or the local side closed the channel.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("invalid message: bad magic in checksum low byte {0:#04x}")]
    InvalidMagic(u8),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("frame size mismatch: header says {expected}, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}

impl NetError {
    pub fn status_code(&self) -> u16 {
        match self {
            NetError::ConnectionClosed => RPCCode::CONNECTION_CLOSED,
            NetError::ConnectFailed { .. } => RPCCode::CONNECT_FAILED,
            NetError::Timeout => RPCCode::TIMEOUT,
            NetError::Io(_) => StatusCode::IO_ERROR,
            NetError::ChecksumMismatch { .. } => StatusCode::DATA_CORRUPTION,
            NetError::InvalidMagic(_)
            | NetError::MessageTooLarge { .. }
            | NetError::FrameSize { .. } => RPCCode::INVALID_MESSAGE,
            NetError::Codec(_) => RPCCode::BAD_DATA,
        }
    }
}

impl From<NetError> for Status {
    fn from(err: NetError) -> Self {
        Status::with_message(err.status_code(), err.to_string())
    }
}
