//! Seam to transports that multiplex streams natively.
//!
//! Such a transport moves [`WireUnit`]s and offers request/response, request/stream and channel
//! interactions itself, so no stream ids or signals travel on the wire.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::GatewayError;

mod interrupt;
pub mod in_process;

pub(crate) use interrupt::{interrupt_on, until_failure};

/// The unit carried by a natively multiplexing transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireUnit {
    /// Encoded header map.
    pub metadata: Bytes,
    /// Opaque application payload.
    pub data: Option<Bytes>,
}

impl WireUnit {
    /// Discard this unit, releasing its buffers.
    pub fn release(self) {
        tracing::trace!(
            metadata_len = self.metadata.len(),
            data_len = self.data.as_ref().map_or(0, Bytes::len),
            "Releasing discarded wire unit"
        );
    }
}

pub type UnitStream = BoxStream<'static, Result<WireUnit, TransportError>>;

/// Errors raised by a native transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The channel closed underneath an interaction.
    #[error("channel closed")]
    ChannelClosed,

    #[error("failed to connect to '{endpoint}': {reason}")]
    Connect { endpoint: String, reason: String },

    /// The responder does not offer this interaction.
    #[error("interaction not supported: {0}")]
    Unsupported(&'static str),

    #[error("transport failure: {0}")]
    Failure(String),
}

impl From<TransportError> for GatewayError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::ChannelClosed => GatewayError::ConnectionClosed,
            TransportError::Connect { endpoint, reason } => {
                GatewayError::Connect { endpoint, reason }
            }
            TransportError::Unsupported(interaction) => {
                GatewayError::UnsupportedOperation(interaction)
            }
            TransportError::Failure(reason) => GatewayError::internal(reason),
        }
    }
}

/// The interactions a native transport offers, on either side of a connection.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn request_response(&self, unit: WireUnit) -> Result<WireUnit, TransportError>;

    fn request_stream(&self, unit: WireUnit) -> UnitStream;

    fn request_channel(&self, units: BoxStream<'static, WireUnit>) -> UnitStream;
}

/// Hands out the responder for each connection a native transport accepts.
///
/// Responders that keep per-connection state create a fresh one per call. A shared responder
/// serves every connection itself.
pub trait ConnectionAcceptor: Send + Sync + 'static {
    fn accept(&self) -> Arc<dyn StreamHandler>;
}

impl<H: StreamHandler> ConnectionAcceptor for Arc<H> {
    fn accept(&self) -> Arc<dyn StreamHandler> {
        self.clone()
    }
}

/// An established native connection.
pub trait MultiplexedConnection: StreamHandler {
    /// Resolves once the connection has closed, whichever side closed it.
    fn on_close(&self) -> BoxFuture<'static, ()>;

    fn is_closed(&self) -> bool;

    /// Close the connection. Interactions still in flight fail with
    /// [`TransportError::ChannelClosed`].
    fn dispose(&self);
}

/// Establishes native connections to one endpoint.
#[async_trait]
pub trait MultiplexedConnector: Send + Sync + 'static {
    type Connection: MultiplexedConnection;

    async fn connect(&self) -> Result<Arc<Self::Connection>, TransportError>;
}

#[async_trait]
impl<K: MultiplexedConnector> MultiplexedConnector for Arc<K> {
    type Connection = K::Connection;

    async fn connect(&self) -> Result<Arc<Self::Connection>, TransportError> {
        self.as_ref().connect().await
    }
}
