//! Multiplexing of logical streams over one physical connection, on the calling side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::{DashMap, Entry};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, trace, warn};

use self::error::{SinkAlreadyTerminated, StreamAlreadyRegistered};
use self::sink::{CancelStream, ResultSink};
use crate::codec::EnvelopeCodec;
use crate::envelope::error::RejectedFrame;
use crate::envelope::{Envelope, Frame, StreamFrame, StreamId, StreamIdGenerator};
use crate::error::{ErrorMapper, GatewayError};

pub mod error;
mod sink;

pub use sink::{Cardinality, OneResponse, ResponseStream, ResultSource};

/// The calling side of a multiplexed connection.
///
/// Every exchange gets a fresh [`StreamId`] whose result sink stays registered from the moment
/// its first frame is sent until its terminal event is observed or the connection dies.
/// Outbound frames are queued for the binding's writer; inbound frames are fed to
/// [`on_frame`](Self::on_frame) in arrival order by the binding's reader.
pub struct ClientSession<C: EnvelopeCodec> {
    codec: C,
    ids: StreamIdGenerator,
    sinks: DashMap<StreamId, ResultSink, ahash::RandomState>,
    outbound: mpsc::Sender<C::Wire>,
    error_mapper: Arc<dyn ErrorMapper>,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl<C: EnvelopeCodec> ClientSession<C> {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(
        codec: C,
        outbound_capacity: usize,
        error_mapper: Arc<dyn ErrorMapper>,
    ) -> (Arc<Self>, mpsc::Receiver<C::Wire>) {
        let (outbound, rx) = mpsc::channel(outbound_capacity.max(1));
        let session = Arc::new(Self {
            codec,
            ids: StreamIdGenerator::new(),
            sinks: DashMap::default(),
            outbound,
            error_mapper,
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        });
        (session, rx)
    }

    /// Send `envelope` on a new stream and return the source of its results.
    pub async fn open(
        self: &Arc<Self>,
        envelope: Envelope,
        cardinality: Cardinality,
    ) -> Result<ResultSource, GatewayError> {
        match cardinality {
            Cardinality::One => self.open_one(envelope).await.map(ResultSource::One),
            Cardinality::Many => self.open_many(envelope).await.map(ResultSource::Many),
        }
    }

    pub async fn open_one(
        self: &Arc<Self>,
        envelope: Envelope,
    ) -> Result<OneResponse, GatewayError> {
        let stream_id = self.ids.next();
        let (sink, rx) = ResultSink::one(stream_id);
        self.start(stream_id, envelope, sink).await?;
        Ok(OneResponse::new(stream_id, rx, self.canceller()))
    }

    pub async fn open_many(
        self: &Arc<Self>,
        envelope: Envelope,
    ) -> Result<ResponseStream, GatewayError> {
        let stream_id = self.ids.next();
        let (sink, rx) = ResultSink::many(stream_id);
        self.start(stream_id, envelope, sink).await?;
        Ok(ResponseStream::new(stream_id, rx, self.canceller()))
    }

    /// Send `envelope` and await its single result.
    pub async fn request_response(
        self: &Arc<Self>,
        envelope: Envelope,
    ) -> Result<Envelope, GatewayError> {
        self.open_one(envelope).await?.await
    }

    /// Send `envelope` and return the stream of its results.
    pub async fn request_stream(
        self: &Arc<Self>,
        envelope: Envelope,
    ) -> Result<ResponseStream, GatewayError> {
        self.open_many(envelope).await
    }

    fn canceller(self: &Arc<Self>) -> Weak<dyn CancelStream> {
        let weak: Weak<Self> = Arc::downgrade(self);
        weak
    }

    async fn start(
        &self,
        stream_id: StreamId,
        envelope: Envelope,
        sink: ResultSink,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            envelope.release();
            return Err(GatewayError::ConnectionClosed);
        }

        let frame = StreamFrame::data(stream_id, envelope).into_envelope();
        let wire = match self.codec.encode(&frame) {
            Ok(wire) => wire,
            Err(error) => {
                frame.release();
                return Err(error);
            }
        };

        // Wait for queue space before registering so a caller dropped mid-wait leaves no sink.
        let Ok(permit) = self.outbound.reserve().await else {
            return Err(GatewayError::ConnectionClosed);
        };

        self.register(sink).map_err(|e| {
            error!(error = %e, "Refusing to open stream");
            GatewayError::ProtocolViolation(e.to_string())
        })?;

        // A dispose racing with the registration above may have missed this sink.
        if self.is_closed() {
            self.sinks.remove(&stream_id);
            return Err(GatewayError::ConnectionClosed);
        }

        permit.send(wire);
        self.touch();
        trace!(%stream_id, "Opened stream");
        Ok(())
    }

    fn register(&self, sink: ResultSink) -> Result<(), StreamAlreadyRegistered> {
        let stream_id = sink.stream_id();
        match self.sinks.entry(stream_id) {
            Entry::Occupied(_) => Err(StreamAlreadyRegistered { stream_id }),
            Entry::Vacant(slot) => {
                slot.insert(sink);
                Ok(())
            }
        }
    }

    /// Abandon a stream: its sink is removed and the peer is told to stop producing.
    ///
    /// Does nothing if the stream is not registered. The notification is best effort and its
    /// failure is only logged.
    pub fn cancel(&self, stream_id: StreamId) {
        let Some((_, mut sink)) = self.sinks.remove(&stream_id) else {
            return;
        };
        report(sink.cancel(GatewayError::Cancelled));

        if self.is_closed() {
            return;
        }

        let wire = match self.codec.encode(&StreamFrame::cancel(stream_id).into_envelope()) {
            Ok(wire) => wire,
            Err(error) => {
                debug!(%stream_id, %error, "Failed to encode cancel notification");
                return;
            }
        };

        match self.outbound.try_send(wire) {
            Ok(()) => {
                self.touch();
                debug!(%stream_id, "Sent cancel notification");
            }
            Err(TrySendError::Full(wire)) => {
                let outbound = self.outbound.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if outbound.send(wire).await.is_err() {
                                debug!(%stream_id, "Connection closed before cancel notification");
                            }
                        });
                    }
                    Err(_) => debug!(%stream_id, "No runtime to send cancel notification"),
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%stream_id, "Connection closed before cancel notification");
            }
        }
    }

    /// Route one inbound wire unit to the sink of its stream.
    pub fn on_frame(&self, wire: C::Wire) {
        self.touch();

        let envelope = match self.codec.decode(wire) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "Discarding undecodable frame");
                return;
            }
        };

        let StreamFrame { stream_id, frame } = match StreamFrame::try_from_envelope(envelope) {
            Ok(frame) => frame,
            Err(RejectedFrame { error, envelope }) => {
                warn!(%error, "Discarding malformed frame");
                envelope.release();
                if let Some(stream_id) = error.stream_id() {
                    self.terminate(stream_id, |sink| {
                        sink.fail(GatewayError::ProtocolViolation(error.to_string()))
                    });
                }
                return;
            }
        };

        match frame {
            Frame::Data(envelope) if envelope.is_error() => self.fail(stream_id, envelope),
            Frame::Data(envelope) => self.deliver(stream_id, envelope),
            Frame::Error(envelope) => self.fail(stream_id, envelope),
            Frame::Complete => {
                if !self.terminate(stream_id, ResultSink::complete) {
                    debug!(%stream_id, "Discarding late completion");
                }
            }
            Frame::Cancel => {
                let cancelled = self.terminate(stream_id, |sink| {
                    sink.cancel(GatewayError::ProtocolViolation(format!(
                        "stream {stream_id} was cancelled by the peer"
                    )))
                });
                if cancelled {
                    debug!(%stream_id, "Stream cancelled by peer");
                }
            }
        }
    }

    fn deliver(&self, stream_id: StreamId, envelope: Envelope) {
        if let Some((_, mut sink)) = self.sinks.remove_if(&stream_id, |_, sink| sink.is_one()) {
            report(sink.next(envelope));
            return;
        }

        match self.sinks.get_mut(&stream_id) {
            Some(mut sink) => report(sink.next(envelope)),
            None => {
                debug!(%stream_id, "Discarding late frame");
                envelope.release();
            }
        }
    }

    fn fail(&self, stream_id: StreamId, envelope: Envelope) {
        match self.sinks.remove(&stream_id) {
            Some((_, mut sink)) => {
                let error = self.error_mapper.to_error(&envelope);
                envelope.release();
                report(sink.fail(error));
            }
            None => {
                debug!(%stream_id, "Discarding late error");
                envelope.release();
            }
        }
    }

    /// Deregister the sink of `stream_id` and give it its terminal event.
    ///
    /// Returns whether the stream was registered.
    fn terminate(
        &self,
        stream_id: StreamId,
        terminal: impl FnOnce(&mut ResultSink) -> Result<(), SinkAlreadyTerminated>,
    ) -> bool {
        match self.sinks.remove(&stream_id) {
            Some((_, mut sink)) => {
                report(terminal(&mut sink));
                true
            }
            None => false,
        }
    }

    /// Fail every registered stream with [`GatewayError::ConnectionClosed`] and refuse new ones.
    pub fn dispose(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let stream_ids: Vec<StreamId> = self.sinks.iter().map(|entry| *entry.key()).collect();
        if !stream_ids.is_empty() {
            debug!(streams = stream_ids.len(), "Failing pending streams");
        }
        for stream_id in stream_ids {
            self.terminate(stream_id, |sink| sink.fail(GatewayError::ConnectionClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of streams still waiting for their terminal event.
    pub fn pending_streams(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_registered(&self, stream_id: StreamId) -> bool {
        self.sinks.contains_key(&stream_id)
    }

    /// Time since the last frame was sent or received.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

impl<C: EnvelopeCodec> CancelStream for ClientSession<C> {
    fn cancel_stream(&self, stream_id: StreamId) {
        self.cancel(stream_id);
    }
}

impl<C: EnvelopeCodec> std::fmt::Debug for ClientSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("codec", &self.codec)
            .field("pending_streams", &self.sinks.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn report(result: Result<(), SinkAlreadyTerminated>) {
    if let Err(error) = result {
        error!(%error, "Refused terminal event for finished stream");
    }
}
