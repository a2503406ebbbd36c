use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::debug;

use super::invoker::{EnvelopeResult, ServiceInvoker};
use super::session::{GatewaySessionHandler, NoopSessionHandler, SessionId};
use crate::codec::{EnvelopeCodec, HeadersCodec, JsonHeadersCodec, WireUnitCodec};
use crate::envelope::{Envelope, KEEPALIVE_QUALIFIER};
use crate::error::{ErrorMapper, GatewayError, default_error_mapper};
use crate::transport::{
    ConnectionAcceptor, StreamHandler, TransportError, UnitStream, WireUnit, interrupt_on,
    until_failure,
};

/// Accepts connections of a natively multiplexing transport and answers them with a
/// [`ServiceInvoker`].
///
/// Every accepted connection gets its own [`NativeGatewaySession`], opened and closed with the
/// connection. Failures travel back as error-qualified units carrying the mapped error data, so
/// the transport itself only ever fails for transport reasons.
pub struct NativeGatewayAcceptor<H: HeadersCodec = JsonHeadersCodec> {
    shared: Arc<Shared<H>>,
}

struct Shared<H: HeadersCodec> {
    codec: WireUnitCodec<H>,
    invoker: Arc<dyn ServiceInvoker>,
    error_mapper: Arc<dyn ErrorMapper>,
    handler: Arc<dyn GatewaySessionHandler>,
}

impl NativeGatewayAcceptor {
    pub fn new(invoker: Arc<dyn ServiceInvoker>) -> Self {
        Self::with_parts(
            WireUnitCodec::default(),
            invoker,
            default_error_mapper(),
            Arc::new(NoopSessionHandler),
        )
    }
}

impl<H: HeadersCodec> NativeGatewayAcceptor<H> {
    pub fn with_parts(
        codec: WireUnitCodec<H>,
        invoker: Arc<dyn ServiceInvoker>,
        error_mapper: Arc<dyn ErrorMapper>,
        handler: Arc<dyn GatewaySessionHandler>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                codec,
                invoker,
                error_mapper,
                handler,
            }),
        }
    }

    /// Open a session for one new connection.
    pub fn open_session(&self) -> NativeGatewaySession<H> {
        let id = SessionId::next();
        self.shared.handler.on_session_open(id);
        debug!(session_id = %id, "Native gateway session opened");
        NativeGatewaySession {
            inner: Arc::new(Inner {
                id,
                shared: self.shared.clone(),
            }),
        }
    }
}

impl<H: HeadersCodec> ConnectionAcceptor for NativeGatewayAcceptor<H> {
    fn accept(&self) -> Arc<dyn StreamHandler> {
        Arc::new(self.open_session())
    }
}

/// The gateway side of one native connection.
///
/// Dropping it closes the session.
pub struct NativeGatewaySession<H: HeadersCodec = JsonHeadersCodec> {
    inner: Arc<Inner<H>>,
}

struct Inner<H: HeadersCodec> {
    id: SessionId,
    shared: Arc<Shared<H>>,
}

impl<H: HeadersCodec> NativeGatewaySession<H> {
    pub fn id(&self) -> SessionId {
        self.inner.id
    }
}

impl<H: HeadersCodec> Drop for Inner<H> {
    fn drop(&mut self) {
        debug!(session_id = %self.id, "Native gateway session closed");
        self.shared.handler.on_session_close(self.id);
    }
}

impl<H: HeadersCodec> Inner<H> {
    fn decode(&self, unit: WireUnit) -> Result<Envelope, GatewayError> {
        self.shared
            .codec
            .decode(unit)
            .map_err(|e| GatewayError::bad_request(e.to_string()))
    }

    fn encode(&self, result: EnvelopeResult) -> Result<WireUnit, TransportError> {
        let envelope = match result {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(session_id = %self.id, %error, "Invocation failed");
                self.shared.handler.on_session_error(self.id, &error);
                self.shared.error_mapper.to_error_data(&error).into_envelope()
            }
        };
        self.shared
            .codec
            .encode(&envelope)
            .map_err(|e| TransportError::Failure(e.to_string()))
    }

    fn invoke(&self, request: Envelope) -> BoxStream<'static, EnvelopeResult> {
        if request.qualifier() == Some(KEEPALIVE_QUALIFIER) {
            request.release();
            let reply = Envelope::builder().qualifier(KEEPALIVE_QUALIFIER).build();
            return futures::stream::once(async move { Ok(reply) }).boxed();
        }

        let request = self.shared.handler.map_message(self.id, request);
        self.shared.invoker.invoke(request).into_stream()
    }

    /// Encode results, sending failures as error units.
    fn respond(self: &Arc<Self>, results: BoxStream<'static, EnvelopeResult>) -> UnitStream {
        let inner = self.clone();
        results.map(move |result| inner.encode(result)).boxed()
    }
}

#[async_trait]
impl<H: HeadersCodec> StreamHandler for NativeGatewaySession<H> {
    async fn request_response(&self, unit: WireUnit) -> Result<WireUnit, TransportError> {
        let result = match self.inner.decode(unit) {
            Ok(request) => match self.inner.invoke(request).next().await {
                Some(result) => result,
                None => Err(GatewayError::ProtocolViolation(
                    "service produced no result".to_string(),
                )),
            },
            Err(error) => Err(error),
        };
        self.inner.encode(result)
    }

    fn request_stream(&self, unit: WireUnit) -> UnitStream {
        let results = match self.inner.decode(unit) {
            Ok(request) => self.inner.invoke(request),
            Err(error) => futures::stream::once(async move { Err(error) }).boxed(),
        };
        self.inner.respond(results)
    }

    /// An undecodable request ends the channel with a 400 error unit.
    fn request_channel(&self, units: BoxStream<'static, WireUnit>) -> UnitStream {
        let inner = self.inner.clone();
        let (requests, failure) = until_failure(units, move |unit| {
            let request = inner.decode(unit)?;
            Ok(inner.shared.handler.map_message(inner.id, request))
        });

        let results = self.inner.shared.invoker.invoke_channel(requests);
        self.inner.respond(interrupt_on(results, failure))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::envelope::error_qualifier;
    use crate::error::ErrorData;
    use crate::server::invoker::Invocation;

    struct Doubler;

    impl ServiceInvoker for Doubler {
        fn invoke(&self, request: Envelope) -> Invocation {
            match request.qualifier() {
                Some("/double") => {
                    let payload = request.payload().cloned().unwrap_or_default();
                    Invocation::many(futures::stream::iter(vec![
                        Ok(Envelope::builder().payload(payload.clone()).build()),
                        Ok(Envelope::builder().payload(payload).build()),
                    ]))
                }
                _ => Invocation::failed(GatewayError::bad_request("unknown service")),
            }
        }
    }

    /// Echoes channel requests.
    struct ChannelEcho;

    impl ServiceInvoker for ChannelEcho {
        fn invoke(&self, _request: Envelope) -> Invocation {
            Invocation::failed(GatewayError::bad_request("channels only"))
        }

        fn invoke_channel(
            &self,
            requests: BoxStream<'static, Envelope>,
        ) -> BoxStream<'static, EnvelopeResult> {
            requests.map(Ok).boxed()
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<(&'static str, SessionId)>>,
    }

    impl GatewaySessionHandler for RecordingHandler {
        fn on_session_open(&self, session_id: SessionId) {
            self.events.lock().push(("open", session_id));
        }

        fn on_session_close(&self, session_id: SessionId) {
            self.events.lock().push(("close", session_id));
        }
    }

    fn session() -> NativeGatewaySession {
        NativeGatewayAcceptor::new(Arc::new(Doubler)).open_session()
    }

    fn unit(qualifier: &str) -> WireUnit {
        let request = Envelope::builder()
            .qualifier(qualifier)
            .payload(Bytes::from_static(b"\x01\x02"))
            .build();
        WireUnitCodec::<JsonHeadersCodec>::default()
            .encode(&request)
            .unwrap()
    }

    fn decode(unit: WireUnit) -> Envelope {
        WireUnitCodec::<JsonHeadersCodec>::default()
            .decode(unit)
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_of_results() {
        let units: Vec<_> = session().request_stream(unit("/double")).collect().await;
        assert_eq!(units.len(), 2);
        for unit in units {
            assert_eq!(unit.unwrap().data.as_deref(), Some(&b"\x01\x02"[..]));
        }
    }

    #[tokio::test]
    async fn test_failure_is_error_unit() {
        let reply = session()
            .request_response(unit("/missing"))
            .await
            .unwrap();
        let reply = decode(reply);

        assert_eq!(reply.qualifier(), Some(error_qualifier(400).as_str()));
        assert_eq!(
            ErrorData::from_envelope(&reply),
            ErrorData::new(400, "unknown service")
        );
    }

    #[tokio::test]
    async fn test_channel_unsupported_by_default() {
        let requests = futures::stream::iter(vec![unit("/double")]).boxed();
        let units: Vec<_> = session().request_channel(requests).collect().await;

        assert_eq!(units.len(), 1);
        assert_eq!(decode(units[0].clone().unwrap()).error_code(), Some(503));
    }

    #[tokio::test]
    async fn test_keepalive_answered() {
        let reply = session()
            .request_response(unit(KEEPALIVE_QUALIFIER))
            .await
            .unwrap();
        assert_eq!(decode(reply).qualifier(), Some(KEEPALIVE_QUALIFIER));
    }

    #[tokio::test]
    async fn test_undecodable_channel_request_ends_channel_with_error() {
        let session = NativeGatewayAcceptor::new(Arc::new(ChannelEcho)).open_session();
        let garbled = WireUnit {
            metadata: Bytes::from_static(b"not json"),
            data: None,
        };
        let requests = futures::stream::iter(vec![unit("/a"), garbled, unit("/c")]).boxed();

        let replies: Vec<_> = session
            .request_channel(requests)
            .map(|unit| decode(unit.unwrap()))
            .collect()
            .await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].qualifier(), Some("/a"));
        assert_eq!(replies[1].error_code(), Some(400));
    }

    #[tokio::test]
    async fn test_each_connection_is_its_own_session() {
        let handler = Arc::new(RecordingHandler::default());
        let acceptor = <NativeGatewayAcceptor>::with_parts(
            WireUnitCodec::default(),
            Arc::new(Doubler),
            default_error_mapper(),
            handler.clone(),
        );

        let first = acceptor.accept();
        let second = acceptor.open_session();
        let second_id = second.id();
        assert_eq!(handler.events.lock().len(), 2);

        drop(first);
        drop(second);
        let events = handler.events.lock().clone();
        assert_eq!(events.len(), 4);
        assert_eq!(events[1], ("open", second_id));
        assert_eq!(events[3], ("close", second_id));
        assert_ne!(events[0].1, second_id);
        assert_eq!(events[2], ("close", events[0].1));
    }
}
