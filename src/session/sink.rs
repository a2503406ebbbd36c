use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::error::SinkAlreadyTerminated;
use crate::envelope::{Envelope, StreamId};
use crate::error::GatewayError;

type Item = Result<Envelope, GatewayError>;

/// Whether an exchange expects exactly one result or a sequence of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

enum Target {
    One(Option<oneshot::Sender<Item>>),
    Many(Option<mpsc::UnboundedSender<Item>>),
}

/// The destination of one stream's results.
///
/// A sink delivers exactly one terminal event. Any later event is refused with
/// [`SinkAlreadyTerminated`].
pub(crate) struct ResultSink {
    stream_id: StreamId,
    target: Target,
}

impl ResultSink {
    pub(crate) fn one(stream_id: StreamId) -> (Self, oneshot::Receiver<Item>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            stream_id,
            target: Target::One(Some(tx)),
        };
        (sink, rx)
    }

    pub(crate) fn many(stream_id: StreamId) -> (Self, mpsc::UnboundedReceiver<Item>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            stream_id,
            target: Target::Many(Some(tx)),
        };
        (sink, rx)
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn is_one(&self) -> bool {
        matches!(self.target, Target::One(_))
    }

    fn terminated(&self) -> SinkAlreadyTerminated {
        SinkAlreadyTerminated {
            stream_id: self.stream_id,
        }
    }

    /// Deliver a value. For a one-result sink this is also its terminal event.
    pub(crate) fn next(&mut self, envelope: Envelope) -> Result<(), SinkAlreadyTerminated> {
        let undelivered = match &mut self.target {
            Target::One(tx) => match tx.take() {
                Some(tx) => tx.send(Ok(envelope)).err(),
                None => {
                    envelope.release();
                    return Err(self.terminated());
                }
            },
            Target::Many(Some(tx)) => tx.send(Ok(envelope)).err().map(|e| e.0),
            Target::Many(None) => {
                envelope.release();
                return Err(self.terminated());
            }
        };

        // The consumer is already gone.
        if let Some(Ok(envelope)) = undelivered {
            envelope.release();
        }
        Ok(())
    }

    /// End the stream successfully.
    ///
    /// A one-result sink that has not received its value yet fails instead, since the exchange
    /// promised exactly one value.
    pub(crate) fn complete(&mut self) -> Result<(), SinkAlreadyTerminated> {
        match &mut self.target {
            Target::One(tx) => match tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(GatewayError::ProtocolViolation(format!(
                        "stream {} completed without a value",
                        self.stream_id
                    ))));
                    Ok(())
                }
                None => Err(self.terminated()),
            },
            Target::Many(tx) => match tx.take() {
                Some(_) => Ok(()),
                None => Err(self.terminated()),
            },
        }
    }

    /// End the stream with `error`.
    pub(crate) fn fail(&mut self, error: GatewayError) -> Result<(), SinkAlreadyTerminated> {
        let delivered = match &mut self.target {
            Target::One(tx) => tx.take().map(|tx| {
                let _ = tx.send(Err(error));
            }),
            Target::Many(tx) => tx.take().map(|tx| {
                let _ = tx.send(Err(error));
            }),
        };
        delivered.ok_or_else(|| self.terminated())
    }

    /// End the stream because it was cancelled.
    ///
    /// A sequence simply ends; a single result fails with `error`.
    pub(crate) fn cancel(&mut self, error: GatewayError) -> Result<(), SinkAlreadyTerminated> {
        match self.target {
            Target::One(_) => self.fail(error),
            Target::Many(_) => self.complete(),
        }
    }
}

/// Receives the cancellation of streams whose consumer went away.
pub(crate) trait CancelStream: Send + Sync {
    fn cancel_stream(&self, stream_id: StreamId);
}

/// Cancels its stream when dropped while still armed.
struct CancelOnDrop {
    stream_id: StreamId,
    session: Weak<dyn CancelStream>,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            session.cancel_stream(self.stream_id);
        }
    }
}

/// The single result of a one-result exchange.
///
/// Dropping it before it resolves cancels the stream.
pub struct OneResponse {
    rx: oneshot::Receiver<Item>,
    guard: CancelOnDrop,
}

impl OneResponse {
    pub(crate) fn new(
        stream_id: StreamId,
        rx: oneshot::Receiver<Item>,
        session: Weak<dyn CancelStream>,
    ) -> Self {
        Self {
            rx,
            guard: CancelOnDrop {
                stream_id,
                session,
                armed: true,
            },
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.guard.stream_id
    }
}

impl Future for OneResponse {
    type Output = Item;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Item> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            // The sink went away without a terminal event.
            Poll::Ready(Err(_)) => Err(GatewayError::ConnectionClosed),
        };
        self.guard.disarm();
        Poll::Ready(result)
    }
}

/// The results of a many-result exchange.
///
/// The stream ends after its completion or after yielding one error. Dropping it before then
/// cancels the stream.
pub struct ResponseStream {
    rx: UnboundedReceiverStream<Item>,
    guard: CancelOnDrop,
}

impl ResponseStream {
    pub(crate) fn new(
        stream_id: StreamId,
        rx: mpsc::UnboundedReceiver<Item>,
        session: Weak<dyn CancelStream>,
    ) -> Self {
        Self {
            rx: UnboundedReceiverStream::new(rx),
            guard: CancelOnDrop {
                stream_id,
                session,
                armed: true,
            },
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.guard.stream_id
    }
}

impl Stream for ResponseStream {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Item>> {
        if !self.guard.armed {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(envelope))) => Poll::Ready(Some(Ok(envelope))),
            Poll::Ready(Some(Err(error))) => {
                self.guard.disarm();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.guard.disarm();
                Poll::Ready(None)
            }
        }
    }
}

/// The result source handed out by [`ClientSession::open`](super::ClientSession::open).
pub enum ResultSource {
    One(OneResponse),
    Many(ResponseStream),
}

impl ResultSource {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::One(response) => response.stream_id(),
            Self::Many(stream) => stream.stream_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::builder().qualifier("/x").build()
    }

    #[test]
    fn test_one_sink_refuses_second_terminal() {
        let (mut sink, mut rx) = ResultSink::one(StreamId::new(1));

        sink.next(envelope()).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), envelope());

        let error = sink.complete().unwrap_err();
        assert_eq!(error.stream_id, StreamId::new(1));
        assert!(sink.fail(GatewayError::ConnectionClosed).is_err());
    }

    #[test]
    fn test_one_sink_empty_completion_fails() {
        let (mut sink, mut rx) = ResultSink::one(StreamId::new(2));

        sink.complete().unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(GatewayError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_many_sink_values_then_completion() {
        let (mut sink, mut rx) = ResultSink::many(StreamId::new(3));

        sink.next(envelope()).unwrap();
        sink.next(envelope()).unwrap();
        sink.complete().unwrap();

        assert!(rx.try_recv().unwrap().is_ok());
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        assert!(sink.next(envelope()).is_err());
        assert!(sink.complete().is_err());
    }

    #[test]
    fn test_delivery_to_departed_consumer_is_not_an_error() {
        let (mut sink, rx) = ResultSink::many(StreamId::new(4));
        drop(rx);

        assert!(sink.next(envelope()).is_ok());
        assert!(sink.fail(GatewayError::ConnectionClosed).is_ok());
    }
}
