use bytes::{BufMut, Bytes, BytesMut};

use crate::error::NetError;

pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Low byte of every frame checksum.
pub const MESSAGE_MAGIC: u8 = 0x86;

pub const MESSAGE_MAX_SIZE: usize = 512 * 1024 * 1024;

/// Frame header: CRC32C of the payload with the magic byte folded into the
/// low byte, then the payload length. Both little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub checksum: u32,
    pub size: u32,
}

/// CRC32C of `payload` with the low byte replaced by `MESSAGE_MAGIC`.
pub fn frame_checksum(payload: &[u8]) -> u32 {
    (crc32c::crc32c(payload) & !0xff) | MESSAGE_MAGIC as u32
}

impl MessageHeader {
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            checksum: frame_checksum(payload),
            size: payload.len() as u32,
        }
    }

    pub fn from_bytes(data: &[u8; MESSAGE_HEADER_SIZE]) -> Self {
        let checksum = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Self { checksum, size }
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Checks that can run before the payload has been read.
    pub fn check(&self) -> Result<usize, NetError> {
        if (self.checksum & 0xff) as u8 != MESSAGE_MAGIC {
            return Err(NetError::InvalidMagic((self.checksum & 0xff) as u8));
        }
        let size = self.size as usize;
        if size > MESSAGE_MAX_SIZE {
            return Err(NetError::MessageTooLarge {
                size,
                max: MESSAGE_MAX_SIZE,
            });
        }
        Ok(size)
    }

    pub fn validate(&self, payload: &[u8]) -> Result<(), NetError> {
        self.check()?;
        let expected = frame_checksum(payload);
        if self.checksum != expected {
            return Err(NetError::ChecksumMismatch {
                expected,
                actual: self.checksum,
            });
        }
        Ok(())
    }
}

/// Header followed by payload, ready for a single write.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, NetError> {
    if payload.len() > MESSAGE_MAX_SIZE {
        return Err(NetError::MessageTooLarge {
            size: payload.len(),
            max: MESSAGE_MAX_SIZE,
        });
    }
    let header = MessageHeader::for_payload(payload);
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split a complete frame into its validated payload.
pub fn decode_frame(frame: &Bytes) -> Result<Bytes, NetError> {
    let Some(head) = frame.get(..MESSAGE_HEADER_SIZE) else {
        return Err(NetError::FrameSize {
            expected: MESSAGE_HEADER_SIZE,
            actual: frame.len(),
        });
    };
    let mut raw = [0u8; MESSAGE_HEADER_SIZE];
    raw.copy_from_slice(head);
    let header = MessageHeader::from_bytes(&raw);
    let size = header.check()?;
    let payload = frame.slice(MESSAGE_HEADER_SIZE..);
    if payload.len() != size {
        return Err(NetError::FrameSize {
            expected: size,
            actual: payload.len(),
        });
    }
    header.validate(&payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_little_endian() {
        let data = [0x86, 0x02, 0x03, 0x04, 0x05, 0x00, 0x00, 0x00];
        let hdr = MessageHeader::from_bytes(&data);
        assert_eq!(hdr.checksum, 0x0403_0286);
        assert_eq!(hdr.size, 5);
        assert_eq!(hdr.to_bytes(), data);
    }

    #[test]
    fn test_checksum_carries_magic() {
        let checksum = frame_checksum(b"mount share");
        assert_eq!(checksum & 0xff, MESSAGE_MAGIC as u32);
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_frame(b"walk").unwrap();
        assert_eq!(frame.len(), MESSAGE_HEADER_SIZE + 4);
        assert_eq!(&decode_frame(&frame).unwrap()[..], b"walk");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let hdr = MessageHeader {
            checksum: 0x1234_5678,
            size: 5,
        };
        assert!(matches!(hdr.check(), Err(NetError::InvalidMagic(0x78))));
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let frame = encode_frame(b"read dir page").unwrap();
        let mut bytes = frame.to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = decode_frame(&Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, NetError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_frame(b"truncated").unwrap();
        let err = decode_frame(&frame.slice(..frame.len() - 2)).unwrap_err();
        assert!(matches!(err, NetError::FrameSize { expected: 9, actual: 7 }));
        let err = decode_frame(&Bytes::from_static(b"\x86\x00")).unwrap_err();
        assert!(matches!(err, NetError::FrameSize { expected: 8, actual: 2 }));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let hdr = MessageHeader {
            checksum: MESSAGE_MAGIC as u32,
            size: (MESSAGE_MAX_SIZE + 1) as u32,
        };
        assert!(matches!(hdr.check(), Err(NetError::MessageTooLarge { .. })));
    }
}
