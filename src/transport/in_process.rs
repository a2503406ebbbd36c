//! A native transport whose connections call straight into a responder in the same process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Weak;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::{
    ConnectionAcceptor, MultiplexedConnection, MultiplexedConnector, StreamHandler,
    TransportError, UnitStream, WireUnit,
};

/// Connects to a [`ConnectionAcceptor`] without any I/O.
///
/// Keeps track of the connections it handed out so that they can be dropped from the responder
/// side, the way a remote peer going away would.
pub struct InProcessConnector {
    acceptor: Box<dyn ConnectionAcceptor>,
    connections: Mutex<Vec<Weak<InProcessConnection>>>,
    connects: AtomicUsize,
    reachable: AtomicBool,
}

impl InProcessConnector {
    pub fn new(acceptor: impl ConnectionAcceptor) -> Self {
        Self {
            acceptor: Box::new(acceptor),
            connections: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
        }
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make later connects fail, or succeed again.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Close every live connection from the responder side.
    ///
    /// Returns how many connections were closed.
    pub fn drop_connections(&self) -> usize {
        let connections = std::mem::take(&mut *self.connections.lock());
        let mut dropped = 0;
        for connection in connections.iter().filter_map(Weak::upgrade) {
            if !connection.is_closed() {
                connection.dispose();
                dropped += 1;
            }
        }
        dropped
    }
}

#[async_trait]
impl MultiplexedConnector for InProcessConnector {
    type Connection = InProcessConnection;

    async fn connect(&self) -> Result<Arc<InProcessConnection>, TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                endpoint: "in-process".to_string(),
                reason: "responder unreachable".to_string(),
            });
        }

        let connection = Arc::new(InProcessConnection::new(self.acceptor.accept()));
        debug!(connection_id = %connection.id, "Opened in-process connection");

        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(&connection));
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(connection)
    }
}

/// One in-process connection.
///
/// Holds its responder until disposed, so per-connection responder state ends with it.
pub struct InProcessConnection {
    id: Uuid,
    responder: Mutex<Option<Arc<dyn StreamHandler>>>,
    closed: watch::Sender<bool>,
}

impl InProcessConnection {
    fn new(responder: Arc<dyn StreamHandler>) -> Self {
        Self {
            id: Uuid::new_v4(),
            responder: Mutex::new(Some(responder)),
            closed: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn responder(&self) -> Option<Arc<dyn StreamHandler>> {
        if self.is_closed() {
            return None;
        }
        self.responder.lock().clone()
    }

    /// Ends `inner` with [`TransportError::ChannelClosed`] once the connection closes.
    fn guard(&self, inner: UnitStream) -> UnitStream {
        let mut closed = self.closed.subscribe();

        async_stream::stream! {
            let mut inner = inner;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = closed.wait_for(|closed| *closed) => None,
                    item = inner.next() => Some(item),
                };

                match next {
                    None => {
                        yield Err(TransportError::ChannelClosed);
                        break;
                    }
                    Some(Some(item)) => yield item,
                    Some(None) => break,
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl StreamHandler for InProcessConnection {
    async fn request_response(&self, unit: WireUnit) -> Result<WireUnit, TransportError> {
        let Some(responder) = self.responder() else {
            unit.release();
            return Err(TransportError::ChannelClosed);
        };

        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::ChannelClosed),
            result = responder.request_response(unit) => result,
        }
    }

    fn request_stream(&self, unit: WireUnit) -> UnitStream {
        let Some(responder) = self.responder() else {
            unit.release();
            return futures::stream::once(async { Err(TransportError::ChannelClosed) }).boxed();
        };
        self.guard(responder.request_stream(unit))
    }

    fn request_channel(&self, units: BoxStream<'static, WireUnit>) -> UnitStream {
        let Some(responder) = self.responder() else {
            return futures::stream::once(async { Err(TransportError::ChannelClosed) }).boxed();
        };
        self.guard(responder.request_channel(units))
    }
}

impl MultiplexedConnection for InProcessConnection {
    fn on_close(&self) -> BoxFuture<'static, ()> {
        let mut closed = self.closed.subscribe();
        async move {
            // A dropped sender means the connection is gone, which counts as closed.
            let _ = closed.wait_for(|closed| *closed).await;
        }
        .boxed()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn dispose(&self) {
        if !self.closed.send_replace(true) {
            debug!(connection_id = %self.id, "Closed in-process connection");
        }
        self.responder.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    /// Echoes request units, streaming three copies for streams.
    struct Echo;

    #[async_trait]
    impl StreamHandler for Echo {
        async fn request_response(&self, unit: WireUnit) -> Result<WireUnit, TransportError> {
            Ok(unit)
        }

        fn request_stream(&self, unit: WireUnit) -> UnitStream {
            futures::stream::iter(vec![Ok(unit.clone()), Ok(unit.clone()), Ok(unit)]).boxed()
        }

        fn request_channel(&self, units: BoxStream<'static, WireUnit>) -> UnitStream {
            units.map(Ok).boxed()
        }
    }

    /// Never answers.
    struct Silent;

    #[async_trait]
    impl StreamHandler for Silent {
        async fn request_response(&self, _unit: WireUnit) -> Result<WireUnit, TransportError> {
            futures::future::pending().await
        }

        fn request_stream(&self, _unit: WireUnit) -> UnitStream {
            futures::stream::pending().boxed()
        }

        fn request_channel(&self, _units: BoxStream<'static, WireUnit>) -> UnitStream {
            futures::stream::pending().boxed()
        }
    }

    fn unit(data: &'static [u8]) -> WireUnit {
        WireUnit {
            metadata: Bytes::from_static(b"{}"),
            data: Some(Bytes::from_static(data)),
        }
    }

    #[tokio::test]
    async fn test_interactions_reach_responder() {
        let connector = InProcessConnector::new(Arc::new(Echo));
        let connection = connector.connect().await.unwrap();

        assert_eq!(
            connection.request_response(unit(b"1")).await.unwrap(),
            unit(b"1")
        );

        let items: Vec<_> = connection.request_stream(unit(b"2")).collect().await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.as_ref().unwrap() == &unit(b"2")));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_fails_pending_interactions() {
        let connector = InProcessConnector::new(Arc::new(Silent));
        let connection = connector.connect().await.unwrap();

        let pending = tokio::spawn({
            let connection = connection.clone();
            async move { connection.request_response(unit(b"x")).await }
        });
        let mut stream = connection.request_stream(unit(b"y"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.drop_connections(), 1);

        assert!(matches!(
            pending.await.unwrap(),
            Err(TransportError::ChannelClosed)
        ));
        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::ChannelClosed))
        ));
        assert!(stream.next().await.is_none());

        connection.on_close().await;
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_unreachable_connector() {
        let connector = InProcessConnector::new(Arc::new(Echo));
        connector.set_reachable(false);

        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Connect { .. })
        ));
        assert_eq!(connector.connects(), 0);
    }

    /// Counts the responders it has handed out.
    struct PerConnection {
        accepted: Arc<AtomicUsize>,
    }

    impl ConnectionAcceptor for PerConnection {
        fn accept(&self) -> Arc<dyn StreamHandler> {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Arc::new(Echo)
        }
    }

    #[tokio::test]
    async fn test_each_connection_gets_its_own_responder() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let connector = InProcessConnector::new(PerConnection {
            accepted: accepted.clone(),
        });

        let first = connector.connect().await.unwrap();
        let second = connector.connect().await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        first.dispose();
        assert!(matches!(
            first.request_response(unit(b"1")).await,
            Err(TransportError::ChannelClosed)
        ));
        assert_eq!(second.request_response(unit(b"2")).await.unwrap(), unit(b"2"));
    }
}
