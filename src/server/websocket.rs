use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::config::GatewayAcceptorConfig;
use super::invoker::ServiceInvoker;
use super::session::{GatewaySession, GatewaySessionHandler, NoopSessionHandler, SessionId};
use crate::codec::TextFrameCodec;
use crate::error::GatewayError;

/// How long a closing connection may take to flush its close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Accepts WebSocket connections and serves text-frame multiplexed sessions on them.
pub struct WebsocketGatewayAcceptor {
    config: GatewayAcceptorConfig,
    invoker: Arc<dyn ServiceInvoker>,
    handler: Arc<dyn GatewaySessionHandler>,
}

struct LiveSession {
    session: Arc<GatewaySession<TextFrameCodec>>,
    disconnect: oneshot::Sender<()>,
}

struct Shared {
    config: GatewayAcceptorConfig,
    invoker: Arc<dyn ServiceInvoker>,
    handler: Arc<dyn GatewaySessionHandler>,
    sessions: DashMap<SessionId, LiveSession, ahash::RandomState>,
}

impl WebsocketGatewayAcceptor {
    pub fn new(config: GatewayAcceptorConfig, invoker: Arc<dyn ServiceInvoker>) -> Self {
        Self {
            config,
            invoker,
            handler: Arc::new(NoopSessionHandler),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn GatewaySessionHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Bind the listener and start accepting connections in the background.
    pub async fn spawn(self) -> Result<GatewayHandle, GatewayError> {
        let address = self.config.bind_address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| GatewayError::Connect {
                endpoint: address.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| GatewayError::Connect {
            endpoint: address.to_string(),
            reason: e.to_string(),
        })?;
        info!(%local_addr, "Gateway listening");

        let shared = Arc::new(Shared {
            config: self.config,
            invoker: self.invoker,
            handler: self.handler,
            sessions: DashMap::default(),
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        Ok(GatewayHandle {
            local_addr,
            shared,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve(shared.clone(), stream, peer));
                }
                Err(error) => warn!(%error, "Failed to accept connection"),
            },
        }
    }

    let disconnected = shared.disconnect_all();
    info!(disconnected, "Gateway stopped");
}

async fn serve(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(error) => {
            debug!(%peer, %error, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(shared.config.outbound_capacity);
    let session = GatewaySession::new(
        TextFrameCodec,
        shared.invoker.clone(),
        shared.config.error_mapper.clone(),
        shared.handler.clone(),
        outbound_tx,
    );
    let session_id = session.id();

    let (disconnect_tx, mut disconnect_rx) = oneshot::channel();
    shared.sessions.insert(
        session_id,
        LiveSession {
            session: session.clone(),
            disconnect: disconnect_tx,
        },
    );
    info!(%session_id, %peer, "Gateway session opened");

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(text) = frame else { break };
                    if let Err(error) = sink.send(Message::Text(text)).await {
                        debug!(%session_id, %error, "WebSocket write failed");
                        return;
                    }
                }
                _ = &mut stop_rx => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut disconnect_rx => {
                debug!(%session_id, "Disconnecting session");
                break;
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => session.on_frame(text),
                Some(Ok(Message::Binary(data))) => {
                    warn!(%session_id, len = data.len(), "Discarding binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(%session_id, %error, "WebSocket read failed");
                    break;
                }
            },
        }
    }

    shared.sessions.remove(&session_id);
    session.close();

    let _ = stop_tx.send(());
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(%session_id, %peer, "Gateway session ended");
}

impl Shared {
    fn disconnect_all(&self) -> usize {
        let session_ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        let mut disconnected = 0;
        for session_id in session_ids {
            if let Some((_, live)) = self.sessions.remove(&session_id) {
                let _ = live.disconnect.send(());
                disconnected += 1;
            }
        }
        disconnected
    }
}

/// Controls a running [`WebsocketGatewayAcceptor`].
///
/// Dropping the handle stops accepting new connections.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Invocations running across all sessions.
    pub fn active_streams(&self) -> usize {
        self.shared
            .sessions
            .iter()
            .map(|entry| entry.session.active_streams())
            .sum()
    }

    /// Drop every open connection. The listener keeps accepting new ones.
    pub fn disconnect_all(&self) -> usize {
        self.shared.disconnect_all()
    }

    /// Stop accepting, disconnect every session, and wait for the accept loop to end.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(error) = (&mut self.task).await {
            debug!(%error, "Accept loop ended abnormally");
        }
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl std::fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHandle")
            .field("local_addr", &self.local_addr)
            .field("active_sessions", &self.shared.sessions.len())
            .finish()
    }
}
