use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info};

use super::{EnvelopeStream, GatewayClient, check_response};
use crate::codec::{EnvelopeCodec, WireUnitCodec};
use crate::connection::ConnectionCell;
use crate::envelope::Envelope;
use crate::error::{ErrorMapper, GatewayError, default_error_mapper};
use crate::transport::{
    MultiplexedConnection, MultiplexedConnector, StreamHandler, TransportError, UnitStream,
    WireUnit, interrupt_on, until_failure,
};

/// Gateway client over a transport that multiplexes streams natively.
///
/// The transport does the demultiplexing, so this binding only converts envelopes to and from
/// wire units and manages the connection.
pub struct NativeGatewayClient<K: MultiplexedConnector> {
    inner: Arc<Inner<K>>,
}

struct Inner<K: MultiplexedConnector> {
    connector: K,
    cell: ConnectionCell<K::Connection>,
    codec: WireUnitCodec,
    error_mapper: Arc<dyn ErrorMapper>,
}

impl<K: MultiplexedConnector> NativeGatewayClient<K> {
    pub fn new(connector: K) -> Self {
        Self::with_error_mapper(connector, default_error_mapper())
    }

    pub fn with_error_mapper(connector: K, error_mapper: Arc<dyn ErrorMapper>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                cell: ConnectionCell::new(),
                codec: WireUnitCodec::default(),
                error_mapper,
            }),
        }
    }

    /// Whether a live connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.inner
            .cell
            .current()
            .is_some_and(|connection| !connection.is_closed())
    }
}

impl<K: MultiplexedConnector> Inner<K> {
    async fn connection(self: &Arc<Self>) -> Result<Arc<K::Connection>, GatewayError> {
        if let Some(connection) = self.cell.current() {
            if connection.is_closed() {
                self.cell.invalidate(&connection);
            }
        }

        let inner = self.clone();
        self.cell
            .get_or_connect(move || async move { inner.open().await }.boxed())
            .await
    }

    async fn open(self: Arc<Self>) -> Result<Arc<K::Connection>, GatewayError> {
        let connection = self.connector.connect().await?;
        info!("Connected to gateway");

        let closed = connection.on_close();
        let weak_inner = Arc::downgrade(&self);
        let weak_connection = Arc::downgrade(&connection);
        tokio::spawn(async move {
            closed.await;
            let (Some(inner), Some(connection)) = (weak_inner.upgrade(), weak_connection.upgrade())
            else {
                return;
            };
            if inner.cell.invalidate(&connection) {
                info!("Gateway connection closed");
            }
        });

        Ok(connection)
    }

    /// Map a transport failure, forgetting the connection when its channel closed.
    fn transport_error(
        &self,
        connection: &Arc<K::Connection>,
        error: TransportError,
    ) -> GatewayError {
        if matches!(error, TransportError::ChannelClosed) {
            self.cell.invalidate(connection);
        }
        error.into()
    }

    fn encode(&self, request: Envelope) -> Result<WireUnit, GatewayError> {
        let unit = self.codec.encode(&request);
        if unit.is_err() {
            request.release();
        }
        unit
    }

    fn decode(&self, unit: WireUnit) -> Result<Envelope, GatewayError> {
        let response = self.codec.decode(unit)?;
        check_response(self.error_mapper.as_ref(), response)
    }

    /// Turn a stream of response units into a stream of responses ending at the first error.
    fn responses(
        self: Arc<Self>,
        connection: Arc<K::Connection>,
        mut units: UnitStream,
    ) -> EnvelopeStream {
        async_stream::stream! {
            while let Some(unit) = units.next().await {
                match unit {
                    Ok(unit) => {
                        let response = self.decode(unit);
                        let failed = response.is_err();
                        yield response;
                        if failed {
                            break;
                        }
                    }
                    Err(error) => {
                        yield Err(self.transport_error(&connection, error));
                        break;
                    }
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl<K: MultiplexedConnector> GatewayClient for NativeGatewayClient<K> {
    async fn request_response(&self, request: Envelope) -> Result<Envelope, GatewayError> {
        let connection = match self.inner.connection().await {
            Ok(connection) => connection,
            Err(error) => {
                request.release();
                return Err(error);
            }
        };

        let unit = self.inner.encode(request)?;
        match connection.request_response(unit).await {
            Ok(unit) => self.inner.decode(unit),
            Err(error) => Err(self.inner.transport_error(&connection, error)),
        }
    }

    fn request_stream(&self, request: Envelope) -> EnvelopeStream {
        let inner = self.inner.clone();

        async_stream::stream! {
            let connection = match inner.connection().await {
                Ok(connection) => connection,
                Err(error) => {
                    request.release();
                    yield Err(error);
                    return;
                }
            };

            let unit = match inner.encode(request) {
                Ok(unit) => unit,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            let units = connection.request_stream(unit);
            let mut responses = inner.responses(connection, units);
            while let Some(response) = responses.next().await {
                yield response;
            }
        }
        .boxed()
    }

    fn request_channel(&self, requests: BoxStream<'static, Envelope>) -> EnvelopeStream {
        let inner = self.inner.clone();

        async_stream::stream! {
            let connection = match inner.connection().await {
                Ok(connection) => connection,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            // An unencodable request ends the channel and is reported in place of further responses.
            let encoder = inner.clone();
            let (units, failure) = until_failure(requests, move |request| encoder.encode(request));

            let units = connection.request_channel(units);
            let mut responses = interrupt_on(inner.responses(connection, units), failure);
            while let Some(response) = responses.next().await {
                yield response;
            }
        }
        .boxed()
    }

    async fn close(&self) -> Result<(), GatewayError> {
        if let Some(connection) = self.inner.cell.take() {
            debug!("Closing gateway connection");
            connection.dispose();
        }
        Ok(())
    }
}
