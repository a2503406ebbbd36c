//! Caller-side bindings of the gateway.
//!
//! Every binding exposes the same [`GatewayClient`] surface. Connections are opened lazily on
//! first use, shared by concurrent callers, and re-opened on the next call after they drop.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::envelope::Envelope;
use crate::error::{ErrorMapper, GatewayError};

pub mod config;
pub mod http;
pub mod keepalive;
pub mod native;
pub mod websocket;

pub use config::GatewayClientConfig;
pub use http::HttpGatewayClient;
pub use native::NativeGatewayClient;
pub use websocket::WebsocketGatewayClient;

pub type EnvelopeStream = BoxStream<'static, Result<Envelope, GatewayError>>;

/// The calling surface shared by all bindings.
///
/// Responses carrying an error qualifier are surfaced as `Err` through the configured
/// [`ErrorMapper`].
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Send one request and await its single response.
    async fn request_response(&self, request: Envelope) -> Result<Envelope, GatewayError>;

    /// Send one request and stream its responses.
    ///
    /// Nothing is sent until the stream is first polled. Dropping the stream early cancels the
    /// exchange.
    fn request_stream(&self, request: Envelope) -> EnvelopeStream;

    /// Stream requests and responses in both directions.
    fn request_channel(&self, requests: BoxStream<'static, Envelope>) -> EnvelopeStream;

    /// Close the current connection, failing its pending exchanges.
    ///
    /// Idempotent. A later call opens a new connection.
    async fn close(&self) -> Result<(), GatewayError>;
}

/// A stream that fails once with [`GatewayError::UnsupportedOperation`].
pub(crate) fn unsupported(operation: &'static str) -> EnvelopeStream {
    futures::stream::once(async move { Err(GatewayError::UnsupportedOperation(operation)) }).boxed()
}

/// Turn an error-qualified response into the mapped error.
pub(crate) fn check_response(
    mapper: &dyn ErrorMapper,
    response: Envelope,
) -> Result<Envelope, GatewayError> {
    if !response.is_error() {
        return Ok(response);
    }
    let error = mapper.to_error(&response);
    response.release();
    Err(error)
}
