use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use crate::envelope::Envelope;
use crate::error::GatewayError;

pub type EnvelopeResult = Result<Envelope, GatewayError>;

/// The pending result of invoking a service.
pub enum Invocation {
    /// A single result.
    One(BoxFuture<'static, EnvelopeResult>),
    /// A sequence of results. The first error ends it.
    Many(BoxStream<'static, EnvelopeResult>),
}

impl Invocation {
    pub fn one<F>(future: F) -> Self
    where
        F: Future<Output = EnvelopeResult> + Send + 'static,
    {
        Self::One(future.boxed())
    }

    pub fn many<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = EnvelopeResult> + Send + 'static,
    {
        Self::Many(stream.boxed())
    }

    /// An invocation that fails straight away.
    pub fn failed(error: GatewayError) -> Self {
        Self::One(futures::future::ready(Err(error)).boxed())
    }

    /// View the invocation as a sequence that ends after its first error.
    ///
    /// A panicking service surfaces as an internal service error.
    pub fn into_stream(self) -> BoxStream<'static, EnvelopeResult> {
        let results = match self {
            Self::One(future) => future.into_stream().boxed(),
            Self::Many(stream) => stream,
        };

        AssertUnwindSafe(results)
            .catch_unwind()
            .map(|result| {
                result.unwrap_or_else(|_| Err(GatewayError::internal("service invocation panicked")))
            })
            .scan(false, |failed, result| {
                let item = (!*failed).then(|| {
                    *failed = result.is_err();
                    result
                });
                futures::future::ready(item)
            })
            .boxed()
    }
}

/// The service collaborator behind a gateway.
pub trait ServiceInvoker: Send + Sync + 'static {
    /// Invoke the service addressed by the request's qualifier.
    fn invoke(&self, request: Envelope) -> Invocation;

    /// Invoke a bidirectional exchange fed by `requests`.
    fn invoke_channel(
        &self,
        requests: BoxStream<'static, Envelope>,
    ) -> BoxStream<'static, EnvelopeResult> {
        drop(requests);
        futures::stream::once(async {
            Err(GatewayError::UnsupportedOperation("request_channel"))
        })
        .boxed()
    }
}
