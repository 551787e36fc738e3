//! Message framing for the wire protocol.
//!
//! This module provides the request/response frame structure and the
//! incremental decoder used on top of a byte-stream session.

use crate::codec::{CodecError, Meta};
use crate::header::{FrameType, RpcHeader, RPC_HEADER_SIZE};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default frame size limit (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// No decoder accepts frames above this (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Metadata size limit (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Length prefix plus header plus meta length
const FIXED_OVERHEAD: usize = 4 + RPC_HEADER_SIZE + 4;

const META_SERVICE: &str = "service";
const META_CODE: &str = "code";
const META_MESSAGE: &str = "message";

/// A method invocation addressed to a named service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation ID chosen by the caller
    pub corr_id: u64,
    /// Target service name
    pub service: String,
    /// Method identifier within the service
    pub method_id: u32,
    /// Encoded arguments
    pub args: Bytes,
}

/// Error reported by the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    /// Error code
    pub code: u32,
    /// Human readable message
    pub message: String,
    /// Encoded error detail
    pub detail: Bytes,
}

/// Outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Correlation ID copied from the request
    pub corr_id: u64,
    /// Encoded result, or the remote error
    pub body: Result<Bytes, ErrorBody>,
}

/// One RPC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Method invocation
    Request(Request),
    /// Result or remote error
    Response(Response),
}

impl Frame {
    /// Correlation ID carried by the frame
    pub fn corr_id(&self) -> u64 {
        match self {
            Frame::Request(req) => req.corr_id,
            Frame::Response(resp) => resp.corr_id,
        }
    }

    fn parts(&self) -> (RpcHeader, Meta, &Bytes) {
        match self {
            Frame::Request(req) => (
                RpcHeader::request(req.method_id, req.corr_id),
                Meta::new().with_str(META_SERVICE, &req.service),
                &req.args,
            ),
            Frame::Response(Response { corr_id, body }) => match body {
                Ok(result) => (
                    RpcHeader::reply(FrameType::Response, *corr_id),
                    Meta::new(),
                    result,
                ),
                Err(err) => (
                    RpcHeader::reply(FrameType::Error, *corr_id),
                    Meta::new()
                        .with_u32(META_CODE, err.code)
                        .with_str(META_MESSAGE, &err.message),
                    &err.detail,
                ),
            },
        }
    }

    /// Encode into one contiguous buffer, refusing frames above `max_frame_size`
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, CodecError> {
        let (header, meta, payload) = self.parts();

        let meta = meta.encode()?;
        if meta.len() > MAX_META_SIZE {
            return Err(WireError::TooLarge {
                what: "metadata",
                len: meta.len(),
                limit: MAX_META_SIZE,
            }
            .into());
        }

        let total = FIXED_OVERHEAD + meta.len() + payload.len();
        if total > max_frame_size {
            return Err(WireError::TooLarge {
                what: "frame",
                len: total,
                limit: max_frame_size,
            }
            .into());
        }

        let mut out = BytesMut::with_capacity(total);
        out.put_u32((total - 4) as u32);
        header.put(&mut out);
        out.put_u32(meta.len() as u32);
        out.extend_from_slice(&meta);
        out.extend_from_slice(payload);
        Ok(out.freeze())
    }

    fn from_parts(header: RpcHeader, meta: Meta, payload: Bytes) -> Result<Self, WireError> {
        let corr_id = header.corr_id;
        let frame = match header.frame_type {
            FrameType::Request => Frame::Request(Request {
                corr_id,
                service: meta
                    .str(META_SERVICE)
                    .ok_or(WireError::MissingMeta(META_SERVICE))?
                    .to_owned(),
                method_id: header.method_id,
                args: payload,
            }),
            FrameType::Response => Frame::Response(Response {
                corr_id,
                body: Ok(payload),
            }),
            FrameType::Error => Frame::Response(Response {
                corr_id,
                body: Err(ErrorBody {
                    code: meta.u32(META_CODE).ok_or(WireError::MissingMeta(META_CODE))?,
                    message: meta.str(META_MESSAGE).unwrap_or_default().to_owned(),
                    detail: payload,
                }),
            }),
        };
        Ok(frame)
    }
}

/// Incremental decoder over an accumulation buffer
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Decoder with the default frame size limit
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Decoder with a custom limit, capped at [`HARD_MAX_FRAME_SIZE`]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is
    /// still incomplete. Errors are not recoverable: the stream position is
    /// lost and the session should be dropped.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let Some(prefix) = buf.get(..4) else {
            return Ok(None);
        };
        let frame_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

        if frame_len > self.max_frame_size {
            return Err(WireError::TooLarge {
                what: "frame",
                len: frame_len,
                limit: self.max_frame_size,
            }
            .into());
        }
        if frame_len < FIXED_OVERHEAD - 4 {
            return Err(WireError::Malformed("frame shorter than its header").into());
        }
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut body = buf.split_to(frame_len).freeze();
        let header = RpcHeader::take(&mut body)?;

        let meta_len = body.get_u32() as usize;
        if meta_len > MAX_META_SIZE {
            return Err(WireError::TooLarge {
                what: "metadata",
                len: meta_len,
                limit: MAX_META_SIZE,
            }
            .into());
        }
        if meta_len > body.len() {
            return Err(WireError::Malformed("metadata runs past frame end").into());
        }
        let meta = Meta::decode(&body.split_to(meta_len))?;

        Ok(Some(Frame::from_parts(header, meta, body)?))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
