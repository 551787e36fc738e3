//! Fixed 16-byte header at the front of every RPC frame.
//!
//! ```text
//! 0       1       2               4               8                      16
//! +-------+-------+---------------+---------------+-----------------------+
//! |  ver  | type  |   reserved    |   method_id   |        corr_id        |
//! +-------+-------+---------------+---------------+-----------------------+
//! ```
//!
//! All fields are big-endian. The reserved field must be zero.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// RPC header size in bytes
pub const RPC_HEADER_SIZE: usize = 16;

/// Frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Method invocation
    Request = 0x01,
    /// Successful result
    Response = 0x02,
    /// Remote-reported failure
    Error = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(FrameType::Request),
            0x02 => Ok(FrameType::Response),
            0x03 => Ok(FrameType::Error),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// Decoded header. Version and reserved bits are implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHeader {
    /// Frame type
    pub frame_type: FrameType,
    /// Method within the target service; zero on responses
    pub method_id: u32,
    /// Pairs a response with its request
    pub corr_id: u64,
}

impl RpcHeader {
    /// Header for a request
    pub fn request(method_id: u32, corr_id: u64) -> Self {
        Self {
            frame_type: FrameType::Request,
            method_id,
            corr_id,
        }
    }

    /// Header for a response or error
    pub fn reply(frame_type: FrameType, corr_id: u64) -> Self {
        Self {
            frame_type,
            method_id: 0,
            corr_id,
        }
    }

    /// Append the 16 header bytes to `out`
    pub fn put(&self, out: &mut impl BufMut) {
        out.put_u8(WIRE_VERSION);
        out.put_u8(self.frame_type as u8);
        out.put_u16(0);
        out.put_u32(self.method_id);
        out.put_u64(self.corr_id);
    }

    /// Consume 16 header bytes from `src`
    pub fn take(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < RPC_HEADER_SIZE {
            return Err(WireError::Truncated(src.remaining()));
        }

        let version = src.get_u8();
        let frame_type = src.get_u8();
        let reserved = src.get_u16();
        let method_id = src.get_u32();
        let corr_id = src.get_u64();

        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        if reserved != 0 {
            return Err(WireError::ReservedBits);
        }

        Ok(Self {
            frame_type: FrameType::try_from(frame_type)?,
            method_id,
            corr_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_header_layout() {
        let mut out = BytesMut::new();
        RpcHeader::request(7, 0x0102030405060708).put(&mut out);

        assert_eq!(
            &out[..],
            &[1, 0x01, 0, 0, 0, 0, 0, 7, 1, 2, 3, 4, 5, 6, 7, 8]
        );
        let parsed = RpcHeader::take(&mut out.freeze()).unwrap();
        assert_eq!(parsed, RpcHeader::request(7, 0x0102030405060708));
    }

    #[test]
    fn test_header_rejections() {
        let good = {
            let mut out = BytesMut::new();
            RpcHeader::reply(FrameType::Response, 1).put(&mut out);
            out
        };

        let mut bad_version = good.clone();
        bad_version[0] = 2;
        assert_eq!(
            RpcHeader::take(&mut bad_version.freeze()),
            Err(WireError::UnsupportedVersion(2))
        );

        let mut reserved = good.clone();
        reserved[3] = 1;
        assert_eq!(
            RpcHeader::take(&mut reserved.freeze()),
            Err(WireError::ReservedBits)
        );

        let mut unknown = good.clone();
        unknown[1] = 0x7f;
        assert_eq!(
            RpcHeader::take(&mut unknown.freeze()),
            Err(WireError::UnknownFrameType(0x7f))
        );

        assert_eq!(
            RpcHeader::take(&mut &good[..10]),
            Err(WireError::Truncated(10))
        );
    }
}
