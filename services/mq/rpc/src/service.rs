//! Server-side service capability.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RemoteError;

/// A named service that answers remote invocations.
///
/// Implementations decode `args` and encode the result themselves; the RPC
/// layer only carries bytes.
#[async_trait]
pub trait Service: Send + Sync {
    /// Handle one invocation of `method_id`
    async fn call(&self, method_id: u32, args: Bytes) -> Result<Bytes, RemoteError>;
}
