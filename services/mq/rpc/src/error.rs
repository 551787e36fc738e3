//! RPC error types.

use mq_session::SendError;
use mq_wire::{CodecError, ErrorBody};
use bytes::Bytes;
use thiserror::Error;

/// Error reported by the remote side of a call.
///
/// Travels as an error response and is rethrown on the proxy side, so it is
/// never confused with a local or transport failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    /// Numeric error code
    pub code: u32,
    /// Human readable description
    pub message: String,
}

impl RemoteError {
    /// No service registered under the requested name
    pub const UNKNOWN_SERVICE: u32 = 1;
    /// The service does not implement the requested method
    pub const UNKNOWN_METHOD: u32 = 2;
    /// The service failed while handling the call
    pub const SERVICE_FAILURE: u32 = 3;

    /// Build an error with an explicit code
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `UNKNOWN_SERVICE` for `service`
    pub fn unknown_service(service: &str) -> Self {
        Self::new(Self::UNKNOWN_SERVICE, format!("unknown service {:?}", service))
    }

    /// `UNKNOWN_METHOD` for `method_id`
    pub fn unknown_method(method_id: u32) -> Self {
        Self::new(Self::UNKNOWN_METHOD, format!("unknown method {}", method_id))
    }

    /// `SERVICE_FAILURE` with `message`
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(Self::SERVICE_FAILURE, message)
    }
}

impl From<ErrorBody> for RemoteError {
    fn from(body: ErrorBody) -> Self {
        Self {
            code: body.code,
            message: body.message,
        }
    }
}

impl From<RemoteError> for ErrorBody {
    fn from(err: RemoteError) -> Self {
        ErrorBody {
            code: err.code,
            message: err.message,
            detail: Bytes::new(),
        }
    }
}

/// Failure of an RPC operation
#[derive(Error, Debug)]
pub enum RpcError {
    /// The remote service reported an error
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The request could not be handed to the session
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    /// The session disconnected before the response arrived
    #[error("session disconnected")]
    Disconnected,
    /// The session has not connected yet
    #[error("session not connected")]
    NotConnected,
    /// No response within the call timeout
    #[error("call timed out after {timeout_ms} ms")]
    Timeout {
        /// Configured call timeout
        timeout_ms: u64,
    },
    /// A service or proxy with this name is already registered
    #[error("name already registered: {0}")]
    DuplicateName(String),
    /// No proxy registered under this name
    #[error("unknown service: {0}")]
    UnknownService(String),
    /// Frame encoding failed
    #[error("wire error: {0}")]
    Wire(#[from] CodecError),
}

impl RpcError {
    /// Whether the failure was reported by the remote side
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_conversion() {
        let body: ErrorBody = RemoteError::unknown_method(9).into();
        assert_eq!(body.code, RemoteError::UNKNOWN_METHOD);
        assert!(body.detail.is_empty());

        let back = RemoteError::from(body);
        assert_eq!(back.code, RemoteError::UNKNOWN_METHOD);
        assert_eq!(back.message, "unknown method 9");
    }

    #[test]
    fn test_remote_errors_are_distinguishable() {
        let remote = RpcError::from(RemoteError::failure("boom"));
        assert!(remote.is_remote());
        assert!(!RpcError::Disconnected.is_remote());
        assert!(!RpcError::Send(SendError::Closed).is_remote());
        assert_eq!(remote.to_string(), "remote error 3: boom");
    }
}
