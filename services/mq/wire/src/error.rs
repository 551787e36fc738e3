//! Errors raised while framing or parsing RPC traffic.

use thiserror::Error;

/// Frame or header level failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than a header needs
    #[error("truncated header: {0} bytes")]
    Truncated(usize),

    /// Header carries a protocol version this build does not speak
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    /// Frame or metadata larger than allowed
    #[error("{what} of {len} bytes exceeds limit {limit}")]
    TooLarge {
        /// Which part overflowed
        what: &'static str,
        /// Actual size
        len: usize,
        /// Permitted size
        limit: usize,
    },

    /// Reserved header bits are set
    #[error("reserved header bits set")]
    ReservedBits,

    /// Frame type byte is not a known type
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),

    /// A metadata key the frame type requires is absent
    #[error("metadata key {0:?} missing")]
    MissingMeta(&'static str),

    /// Frame structure is inconsistent
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
