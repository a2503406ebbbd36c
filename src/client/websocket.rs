use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::GatewayClientConfig;
use super::keepalive::{KeepaliveTarget, spawn_keepalive};
use super::{EnvelopeStream, GatewayClient, unsupported};
use crate::codec::TextFrameCodec;
use crate::connection::ConnectionCell;
use crate::envelope::Envelope;
use crate::error::GatewayError;
use crate::session::ClientSession;

/// Gateway client multiplexing many exchanges over one WebSocket text-frame connection.
///
/// Bidirectional channels are not supported on this binding.
pub struct WebsocketGatewayClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: GatewayClientConfig,
    cell: ConnectionCell<WsConnection>,
}

/// One physical WebSocket connection and its session.
struct WsConnection {
    id: Uuid,
    session: Arc<ClientSession<TextFrameCodec>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl WebsocketGatewayClient {
    pub fn new(config: GatewayClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cell: ConnectionCell::new(),
            }),
        }
    }

    /// Number of exchanges on the current connection still waiting for their terminal event.
    pub fn pending_streams(&self) -> usize {
        self.inner
            .cell
            .current()
            .map_or(0, |connection| connection.session.pending_streams())
    }

    /// Whether a live connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.inner
            .cell
            .current()
            .is_some_and(|connection| !connection.session.is_closed())
    }
}

impl Inner {
    async fn connection(self: &Arc<Self>) -> Result<Arc<WsConnection>, GatewayError> {
        if let Some(connection) = self.cell.current() {
            if connection.session.is_closed() {
                self.cell.invalidate(&connection);
            }
        }

        let inner = self.clone();
        self.cell
            .get_or_connect(move || async move { WsConnection::open(inner).await })
            .await
    }
}

impl WsConnection {
    async fn open(inner: Arc<Inner>) -> Result<Arc<Self>, GatewayError> {
        let config = &inner.config;
        let url = config.websocket_url()?;
        let id = Uuid::new_v4();
        info!(connection_id = %id, url = %url, "Connecting to gateway");

        let (stream, _response) =
            tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| GatewayError::Connect {
                    endpoint: config.endpoint(),
                    reason: format!("timed out after {:?}", config.connect_timeout),
                })?
                .map_err(|e| GatewayError::Connect {
                    endpoint: config.endpoint(),
                    reason: e.to_string(),
                })?;

        let (mut sink, mut source) = stream.split();
        let (session, mut outbound) = ClientSession::new(
            TextFrameCodec,
            config.outbound_capacity,
            config.error_mapper.clone(),
        );
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let connection = Arc::new(Self {
            id,
            session: session.clone(),
            shutdown: Mutex::new(Some(shutdown_tx)),
            keepalive: Mutex::new(None),
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound.recv() => {
                        let Some(text) = frame else { break };
                        if let Err(error) = sink.send(Message::Text(text)).await {
                            debug!(connection_id = %id, %error, "WebSocket write failed");
                            break;
                        }
                    }
                    _ = &mut shutdown_rx => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        let reader_session = session.clone();
        let weak_inner = Arc::downgrade(&inner);
        let weak_connection = Arc::downgrade(&connection);
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => reader_session.on_frame(text),
                    Ok(Message::Binary(data)) => {
                        warn!(connection_id = %id, len = data.len(), "Discarding binary frame");
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        debug!(connection_id = %id, %error, "WebSocket read failed");
                        break;
                    }
                }
            }

            info!(connection_id = %id, "Gateway connection closed");
            reader_session.dispose();
            if let Some(connection) = weak_connection.upgrade() {
                connection.stop_keepalive();
                if let Some(inner) = weak_inner.upgrade() {
                    inner.cell.invalidate(&connection);
                }
            }
        });

        if let Some(interval) = config.keepalive_interval {
            let task = spawn_keepalive(interval, Arc::downgrade(&connection));
            *connection.keepalive.lock() = Some(task);
        }

        info!(connection_id = %id, "Connected to gateway");
        Ok(connection)
    }

    fn stop_keepalive(&self) {
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
    }

    fn close(&self) {
        debug!(connection_id = %self.id, "Closing gateway connection");
        self.stop_keepalive();
        self.session.dispose();
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
    }
}

#[async_trait]
impl KeepaliveTarget for WsConnection {
    fn idle_for(&self) -> Duration {
        self.session.idle_for()
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    async fn ping(&self, heartbeat: Envelope) -> Result<Envelope, GatewayError> {
        self.session.request_response(heartbeat).await
    }
}

#[async_trait]
impl GatewayClient for WebsocketGatewayClient {
    async fn request_response(&self, request: Envelope) -> Result<Envelope, GatewayError> {
        let connection = match self.inner.connection().await {
            Ok(connection) => connection,
            Err(error) => {
                request.release();
                return Err(error);
            }
        };
        connection.session.request_response(request).await
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

            let mut responses = match connection.session.request_stream(request).await {
                Ok(responses) => responses,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            while let Some(response) = responses.next().await {
                yield response;
            }
        }
        .boxed()
    }

    fn request_channel(&self, requests: BoxStream<'static, Envelope>) -> EnvelopeStream {
        drop(requests);
        unsupported("request_channel")
    }

    async fn close(&self) -> Result<(), GatewayError> {
        if let Some(connection) = self.inner.cell.take() {
            connection.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_gateway_is_connect_error() {
        let client = WebsocketGatewayClient::new(
            GatewayClientConfig::builder()
                .port(1)
                .connect_timeout(Duration::from_secs(2))
                .build(),
        );

        let result = client
            .request_response(Envelope::builder().qualifier("/echo").build())
            .await;
        assert!(matches!(result, Err(GatewayError::Connect { .. })));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_channel_is_unsupported() {
        let client = WebsocketGatewayClient::new(GatewayClientConfig::default());

        let mut responses = client.request_channel(futures::stream::empty().boxed());
        assert!(matches!(
            responses.next().await,
            Some(Err(GatewayError::UnsupportedOperation(_)))
        ));
        assert!(responses.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let client = WebsocketGatewayClient::new(GatewayClientConfig::default());
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.pending_streams(), 0);
    }
}
