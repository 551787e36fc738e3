//! Transport layer: raw sessions bound to byte streams.

pub mod stream;
pub mod tcp;

pub use stream::{stream_pair, SessionStats, StreamSession};
pub use tcp::{connect_tcp, listen_tcp, TcpConnector, TcpListenerEndpoint, TcpTransport};
