//! Remote service dispatch over mq sessions.
//!
//! Each connected session carries two registries: services answering
//! inbound requests and proxies issuing outbound ones. Requests and
//! responses are correlated by a per-call ID, so concurrent calls on one
//! session never cross-deliver.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use mq_rpc::RpcSession;
//! use mq_session::{AppConfig, SessionRef};
//!
//! # async fn example(session: SessionRef) -> Result<(), mq_rpc::RpcError> {
//! let rpc = RpcSession::attach(session, &AppConfig::default());
//! let echo = rpc.register_proxy("echo")?;
//! let reply = echo.call(1, Bytes::from_static(b"ping")).await?;
//! assert_eq!(&reply[..], b"ping");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod service;
pub mod session;

// Re-export main types
pub use error::{RemoteError, RpcError};
pub use service::Service;
pub use session::{RpcProxy, RpcSession};
