//! Listening side of the broker
//!
//! - [`ProxyService`] binds one listen address and runs an accept loop
//! - Each accepted connection resolves fresh credentials, runs the
//!   connector's backend handshake, then hands off to [`DuplexStreamer`]
//! - [`Broker`] starts one service per configured entry

mod broker;
mod listener;
mod proxy_service;
mod relay;
mod stream;

pub use broker::Broker;
pub use listener::ServiceListener;
pub use proxy_service::{
    authenticate, connect_with_credentials, ProxyService, ServiceSpec, ServiceState, ServiceStats,
};
pub use relay::{Direction, DuplexStreamer, StreamSummary, StreamTap, DEFAULT_BUFFER_SIZE};
pub use stream::{ClientTlsStream, NetworkStream};
