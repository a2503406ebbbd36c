//! Transport layer between gateway clients and a service gateway.
//!
//! Every exchange is an [`Envelope`]: a string header map plus an opaque payload. Calls come in
//! three shapes (request/response, request/stream and bidirectional channels) and run over one of
//! three bindings:
//!
//! - a transport with native stream multiplexing ([`client::NativeGatewayClient`])
//! - WebSocket text frames, multiplexed by stream id ([`client::WebsocketGatewayClient`])
//! - plain HTTP request/response ([`client::HttpGatewayClient`])
//!
//! The gateway side lives in [`server`].

pub mod client;
pub mod codec;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{EnvelopeStream, GatewayClient, GatewayClientConfig};
pub use envelope::{Envelope, StreamId};
pub use error::{DefaultErrorMapper, ErrorData, ErrorMapper, GatewayError};
