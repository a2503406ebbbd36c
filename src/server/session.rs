use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, Entry};
use futures::StreamExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use super::invoker::{Invocation, ServiceInvoker};
use crate::codec::EnvelopeCodec;
use crate::envelope::error::RejectedFrame;
use crate::envelope::{Envelope, Frame, KEEPALIVE_QUALIFIER, StreamFrame, StreamId};
use crate::error::{ErrorMapper, GatewayError};

/// Identifies one accepted connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Hooks into the lifecycle of gateway sessions.
///
/// Every method has a no-op default, so implementors only override what they need.
pub trait GatewaySessionHandler: Send + Sync + 'static {
    fn on_session_open(&self, _session_id: SessionId) {}

    fn on_session_close(&self, _session_id: SessionId) {}

    fn on_session_error(&self, _session_id: SessionId, _error: &GatewayError) {}

    /// Rewrite a request before it is handed to the service invoker.
    fn map_message(&self, _session_id: SessionId, request: Envelope) -> Envelope {
        request
    }
}

/// A [`GatewaySessionHandler`] that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessionHandler;

impl GatewaySessionHandler for NoopSessionHandler {}

/// The gateway side of one multiplexed connection.
///
/// Each inbound data frame starts an invocation that is registered under the caller's stream id
/// until it ends. Results travel back on the same stream id, and the invocation is deregistered
/// before its terminal frame is sent.
pub struct GatewaySession<C: EnvelopeCodec> {
    id: SessionId,
    codec: C,
    invoker: Arc<dyn ServiceInvoker>,
    error_mapper: Arc<dyn ErrorMapper>,
    handler: Arc<dyn GatewaySessionHandler>,
    outbound: mpsc::Sender<C::Wire>,
    invocations: DashMap<StreamId, AbortHandle, ahash::RandomState>,
}

impl<C: EnvelopeCodec> GatewaySession<C> {
    pub fn new(
        codec: C,
        invoker: Arc<dyn ServiceInvoker>,
        error_mapper: Arc<dyn ErrorMapper>,
        handler: Arc<dyn GatewaySessionHandler>,
        outbound: mpsc::Sender<C::Wire>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id: SessionId::next(),
            codec,
            invoker,
            error_mapper,
            handler,
            outbound,
            invocations: DashMap::default(),
        });
        session.handler.on_session_open(session.id);
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Number of invocations still running.
    pub fn active_streams(&self) -> usize {
        self.invocations.len()
    }

    pub fn is_active(&self, stream_id: StreamId) -> bool {
        self.invocations.contains_key(&stream_id)
    }

    /// Handle one inbound wire unit.
    pub fn on_frame(self: &Arc<Self>, wire: C::Wire) {
        let envelope = match self.codec.decode(wire) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(session_id = %self.id, %error, "Rejecting undecodable frame");
                self.reject(None, GatewayError::bad_request(error.to_string()));
                return;
            }
        };

        let StreamFrame { stream_id, frame } = match StreamFrame::try_from_envelope(envelope) {
            Ok(frame) => frame,
            Err(RejectedFrame { error, envelope }) => {
                warn!(session_id = %self.id, %error, "Rejecting malformed frame");
                envelope.release();
                self.reject(error.stream_id(), GatewayError::bad_request(error.to_string()));
                return;
            }
        };

        match frame {
            Frame::Data(request) => self.dispatch(stream_id, request),
            Frame::Cancel => {
                if let Some((_, invocation)) = self.invocations.remove(&stream_id) {
                    invocation.abort();
                    debug!(session_id = %self.id, %stream_id, "Cancelled invocation");
                }
            }
            Frame::Complete | Frame::Error(_) => {
                if let Frame::Error(envelope) = frame {
                    envelope.release();
                }
                if let Some((_, invocation)) = self.invocations.remove(&stream_id) {
                    invocation.abort();
                }
                self.reject(
                    Some(stream_id),
                    GatewayError::ProtocolViolation(format!(
                        "stream {stream_id} was terminated by the caller"
                    )),
                );
            }
        }
    }

    fn dispatch(self: &Arc<Self>, stream_id: StreamId, request: Envelope) {
        if request.qualifier() == Some(KEEPALIVE_QUALIFIER) {
            trace!(session_id = %self.id, %stream_id, "Answering keepalive");
            let reply = Envelope::builder().qualifier(KEEPALIVE_QUALIFIER).build();
            request.release();
            self.spawn_reply(vec![
                StreamFrame::data(stream_id, reply),
                StreamFrame::complete(stream_id),
            ]);
            return;
        }

        if self.invocations.contains_key(&stream_id) {
            request.release();
            self.reject(Some(stream_id), already_active(stream_id));
            return;
        }

        // No registry lock is held while user code runs.
        let request = self.handler.map_message(self.id, request);
        debug!(
            session_id = %self.id,
            %stream_id,
            qualifier = request.qualifier().unwrap_or_default(),
            "Invoking service"
        );
        let invocation = self.invoker.invoke(request);

        // The task waits until its abort handle is registered so that its own deregistration
        // can never run first.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let session = self.clone();
        let task = tokio::spawn(async move {
            if registered_rx.await.is_ok() {
                session.run(stream_id, invocation).await;
            }
        });

        let registered = match self.invocations.entry(stream_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(task.abort_handle());
                true
            }
        };
        if !registered {
            task.abort();
            self.reject(Some(stream_id), already_active(stream_id));
            return;
        }
        let _ = registered_tx.send(());
    }

    async fn run(&self, stream_id: StreamId, invocation: Invocation) {
        let mut results = invocation.into_stream();

        let failure = loop {
            match results.next().await {
                Some(Ok(value)) => {
                    if let Err(error) = self.send(StreamFrame::data(stream_id, value)).await {
                        if error.is_connection_error() {
                            self.invocations.remove(&stream_id);
                            return;
                        }
                        break Some(error);
                    }
                }
                Some(Err(error)) => break Some(error),
                None => break None,
            }
        };
        drop(results);

        self.invocations.remove(&stream_id);

        let terminal = match failure {
            None => StreamFrame::complete(stream_id),
            Some(error) => {
                debug!(session_id = %self.id, %stream_id, %error, "Invocation failed");
                let data = self.error_mapper.to_error_data(&error);
                StreamFrame::error(stream_id, data.into_envelope())
            }
        };

        if let Err(error) = self.send(terminal).await {
            debug!(session_id = %self.id, %stream_id, %error, "Failed to send terminal frame");
        }
    }

    async fn send(&self, frame: StreamFrame) -> Result<(), GatewayError> {
        let envelope = frame.into_envelope();
        let wire = match self.codec.encode(&envelope) {
            Ok(wire) => wire,
            Err(error) => {
                envelope.release();
                return Err(error);
            }
        };
        self.outbound
            .send(wire)
            .await
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    /// Answer a frame that could not be accepted with an error.
    ///
    /// The rejection is queued before this returns, so it keeps its place relative to replies
    /// for frames handled later.
    fn reject(&self, stream_id: Option<StreamId>, error: GatewayError) {
        self.handler.on_session_error(self.id, &error);

        let envelope = self.error_mapper.to_error_data(&error).into_envelope();
        let frame = match stream_id {
            Some(stream_id) => StreamFrame::error(stream_id, envelope).into_envelope(),
            None => envelope,
        };
        let wire = match self.codec.encode(&frame) {
            Ok(wire) => wire,
            Err(error) => {
                warn!(session_id = %self.id, %error, "Failed to encode rejection");
                frame.release();
                return;
            }
        };

        match self.outbound.try_send(wire) {
            Ok(()) => {}
            Err(TrySendError::Full(wire)) => {
                let outbound = self.outbound.clone();
                let session_id = self.id;
                tokio::spawn(async move {
                    if outbound.send(wire).await.is_err() {
                        debug!(%session_id, "Connection closed before rejection");
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.id, "Connection closed before rejection");
            }
        }
    }

    fn spawn_reply(self: &Arc<Self>, frames: Vec<StreamFrame>) {
        let session = self.clone();
        tokio::spawn(async move {
            for frame in frames {
                if let Err(error) = session.send(frame).await {
                    debug!(session_id = %session.id, %error, "Failed to send reply");
                    return;
                }
            }
        });
    }

    /// Abort every running invocation. Called once the connection is gone.
    pub fn close(&self) {
        let stream_ids: Vec<StreamId> = self.invocations.iter().map(|e| *e.key()).collect();
        for stream_id in &stream_ids {
            if let Some((_, invocation)) = self.invocations.remove(stream_id) {
                invocation.abort();
            }
        }

        info!(
            session_id = %self.id,
            aborted = stream_ids.len(),
            "Closed gateway session"
        );
        self.handler.on_session_close(self.id);
    }
}

fn already_active(stream_id: StreamId) -> GatewayError {
    GatewayError::ProtocolViolation(format!("stream {stream_id} is already active"))
}

impl<C: EnvelopeCodec> std::fmt::Debug for GatewaySession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySession")
            .field("id", &self.id)
            .field("active_streams", &self.invocations.len())
            .finish()
    }
}
