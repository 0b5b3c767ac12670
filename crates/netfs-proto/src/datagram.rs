//! The discovery broadcast: three big-endian 32-bit words.

use netfs_types::{Result, ServerCode, Status, make_error_msg};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const BROADCAST_MAGIC: u32 = 0x4e73_426d; // 'NsBm'
pub const BROADCAST_PROTOCOL_VERSION: u32 = 1;
pub const BROADCAST_MESSAGE_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum BroadcastType {
    /// Periodic "still here".
    Tick = 0,
    /// The server's descriptor changed.
    Update = 1,
    /// Sent by a starting client to ask servers for an update.
    ClientHello = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub message_type: BroadcastType,
}

impl BroadcastMessage {
    pub fn new(message_type: BroadcastType) -> Self {
        Self { message_type }
    }

    pub fn encode(&self) -> [u8; BROADCAST_MESSAGE_SIZE] {
        let mut buf = [0u8; BROADCAST_MESSAGE_SIZE];
        buf[0..4].copy_from_slice(&BROADCAST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&BROADCAST_PROTOCOL_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&u32::from(self.message_type).to_be_bytes());
        buf
    }

    /// Parse a received datagram, rejecting anything with the wrong size,
    /// magic, version or an unknown message type.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let Ok(raw) = <[u8; BROADCAST_MESSAGE_SIZE]>::try_from(data) else {
            return make_error_msg(
                ServerCode::BAD_DATAGRAM,
                format!("datagram of {} bytes", data.len()),
            );
        };
        let word = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let (magic, version, kind) = (word(0), word(4), word(8));
        if magic != BROADCAST_MAGIC {
            return make_error_msg(ServerCode::BAD_DATAGRAM, format!("bad magic {magic:#010x}"));
        }
        if version != BROADCAST_PROTOCOL_VERSION {
            return make_error_msg(ServerCode::BAD_DATAGRAM, format!("protocol version {version}"));
        }
        let message_type = BroadcastType::try_from(kind)
            .map_err(|_| Status::with_message(ServerCode::BAD_DATAGRAM, format!("type {kind}")))?;
        Ok(Self { message_type })
    }
}
