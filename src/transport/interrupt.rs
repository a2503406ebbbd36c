//! Surfacing a failed channel input on the channel's output.
//!
//! A channel's inbound items are converted lazily while the other side consumes them. When a
//! conversion fails the inbound stream ends there, and the failure has to reach the caller through
//! the outbound stream instead of vanishing.

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

/// Convert `items` until the first failure.
///
/// The returned stream ends at the failing item. The failure itself is delivered on the returned
/// receiver, whose sender is dropped if every item converts.
pub(crate) fn until_failure<T, U, E, F>(
    items: BoxStream<'static, T>,
    convert: F,
) -> (BoxStream<'static, U>, oneshot::Receiver<E>)
where
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
    F: FnMut(T) -> Result<U, E> + Send + 'static,
{
    let (failed_tx, failed_rx) = oneshot::channel();

    let converted = async_stream::stream! {
        let mut items = items;
        let mut convert = convert;
        let mut failed_tx = Some(failed_tx);
        while let Some(item) = items.next().await {
            match convert(item) {
                Ok(converted) => yield converted,
                Err(error) => {
                    if let Some(failed_tx) = failed_tx.take() {
                        let _ = failed_tx.send(error);
                    }
                    break;
                }
            }
        }
    }
    .boxed();

    (converted, failed_rx)
}

enum Next<T, E> {
    Failed(Result<E, oneshot::error::RecvError>),
    Item(Option<Result<T, E>>),
}

/// Pass `outputs` through until `failure` fires, then yield that failure and end.
pub(crate) fn interrupt_on<T, E>(
    outputs: BoxStream<'static, Result<T, E>>,
    failure: oneshot::Receiver<E>,
) -> BoxStream<'static, Result<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut outputs = outputs;
        let mut failure = failure;
        let mut watching = true;
        loop {
            let next = tokio::select! {
                biased;
                failed = &mut failure, if watching => Next::Failed(failed),
                item = outputs.next() => Next::Item(item),
            };

            match next {
                Next::Failed(Ok(error)) => {
                    yield Err(error);
                    break;
                }
                // Every input converted.
                Next::Failed(Err(_)) => watching = false,
                Next::Item(Some(item)) => yield item,
                Next::Item(None) => {
                    // The outputs may end in the same poll that reported the failure.
                    if watching {
                        if let Ok(error) = failure.try_recv() {
                            yield Err(error);
                        }
                    }
                    break;
                }
            }
        }
    }
    .boxed()
}
