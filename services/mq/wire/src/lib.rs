//! RPC framing, CBOR metadata, and incremental frame decoding for mq.
//!
//! This crate provides the byte layout used by the RPC layer to carry
//! requests and responses over an application session. Sessions deliver
//! arbitrary byte chunks, so decoding is incremental over a `BytesMut`
//! accumulation buffer.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | RPC Header (16B)     | type, method, correlation  |
//! +----------------------+----------------------------+
//! | u32 meta_len         | canonical CBOR map length  |
//! +----------------------+----------------------------+
//! | meta_bytes           | service name / error info  |
//! +----------------------+----------------------------+
//! | payload              | args, result or error body |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::{CodecError, Meta};
pub use error::WireError;
pub use frame::{
    ErrorBody, Frame, FrameDecoder, Request, Response, DEFAULT_MAX_FRAME_SIZE,
    HARD_MAX_FRAME_SIZE, MAX_META_SIZE,
};
pub use header::{FrameType, RpcHeader, RPC_HEADER_SIZE, WIRE_VERSION};
