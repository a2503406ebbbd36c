//! Lazy, shared and invalidatable physical connections.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::GatewayError;

type ConnectFuture<T> = Shared<BoxFuture<'static, Result<Arc<T>, GatewayError>>>;

enum State<T> {
    Absent,
    Connecting {
        attempt: u64,
        future: ConnectFuture<T>,
    },
    Established {
        attempt: u64,
        connection: Arc<T>,
    },
}

/// Holds at most one physical connection for a client instance.
///
/// The first caller of [`get_or_connect`](Self::get_or_connect) starts a connect attempt which
/// every concurrent caller then awaits, so exactly one attempt is in flight at a time. A
/// successful attempt is cached until it is [invalidated](Self::invalidate) or
/// [taken](Self::take). A failed attempt clears the cell before its error reaches the callers.
///
/// Every transition is made under one short lock that is never held across an await, and is
/// tagged with the attempt that caused it so that a stale attempt can never clear a newer one.
pub struct ConnectionCell<T> {
    state: Mutex<State<T>>,
    attempts: AtomicU64,
}

impl<T: Send + Sync + 'static> ConnectionCell<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached connection, or await the attempt in flight, or start a new one with
    /// `connect`.
    pub async fn get_or_connect<F, Fut>(&self, connect: F) -> Result<Arc<T>, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>, GatewayError>> + Send + 'static,
    {
        let (attempt, future) = {
            let mut state = self.state.lock();
            match &*state {
                State::Established { connection, .. } => return Ok(connection.clone()),
                State::Connecting { attempt, future } => (*attempt, future.clone()),
                State::Absent => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(attempt, "Starting connect attempt");

                    let future = connect().boxed().shared();
                    *state = State::Connecting {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.state.lock();
        if matches!(&*state, State::Connecting { attempt: current, .. } if *current == attempt) {
            *state = match &result {
                Ok(connection) => State::Established {
                    attempt,
                    connection: connection.clone(),
                },
                Err(error) => {
                    debug!(attempt, %error, "Connect attempt failed");
                    State::Absent
                }
            };
        }

        result
    }

    /// The established connection, without connecting.
    pub fn current(&self) -> Option<Arc<T>> {
        match &*self.state.lock() {
            State::Established { connection, .. } => Some(connection.clone()),
            State::Absent | State::Connecting { .. } => None,
        }
    }

    /// Clear the cell if it still holds `connection`.
    ///
    /// Returns whether the cell was cleared. A connection that was already replaced leaves the
    /// newer one in place.
    pub fn invalidate(&self, connection: &Arc<T>) -> bool {
        let mut state = self.state.lock();
        let (attempt, holds) = match &*state {
            State::Established {
                attempt,
                connection: current,
            } => (*attempt, Arc::ptr_eq(current, connection)),
            State::Connecting { attempt, future } => (
                *attempt,
                matches!(future.peek(), Some(Ok(current)) if Arc::ptr_eq(current, connection)),
            ),
            State::Absent => return false,
        };

        if holds {
            debug!(attempt, "Invalidated connection");
            *state = State::Absent;
        }
        holds
    }

    /// Empty the cell, returning the established connection for disposal.
    ///
    /// An attempt still in flight is forgotten: its callers get its result but it is not cached.
    pub fn take(&self) -> Option<Arc<T>> {
        match std::mem::replace(&mut *self.state.lock(), State::Absent) {
            State::Established { connection, .. } => Some(connection),
            State::Connecting { future, .. } => match future.peek() {
                Some(Ok(connection)) => Some(connection.clone()),
                _ => None,
            },
            State::Absent => None,
        }
    }
}

impl<T> Default for ConnectionCell<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::Absent),
            attempts: AtomicU64::new(0),
        }
    }
}

impl<T> std::fmt::Debug for ConnectionCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            State::Absent => "absent",
            State::Connecting { .. } => "connecting",
            State::Established { .. } => "established",
        };
        f.debug_struct("ConnectionCell")
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[derive(Debug)]
    struct Conn(usize);

    fn connector(
        attempts: &Arc<AtomicUsize>,
        fail: bool,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Arc<Conn>, GatewayError>> {
        let attempts = attempts.clone();
        move || {
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                if fail {
                    Err(GatewayError::Connect {
                        endpoint: "test".into(),
                        reason: "refused".into(),
                    })
                } else {
                    Ok(Arc::new(Conn(n)))
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let cell = ConnectionCell::<Conn>::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let results = futures::future::join_all(
            (0..16).map(|_| cell.get_or_connect(connector(&attempts, false))),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        assert!(results.iter().all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));
        assert!(Arc::ptr_eq(&cell.current().unwrap(), first));
    }

    #[tokio::test]
    async fn test_failed_attempt_clears_cell() {
        let cell = ConnectionCell::<Conn>::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cell.get_or_connect(connector(&attempts, true)),
            cell.get_or_connect(connector(&attempts, true)),
        );
        assert!(matches!(a, Err(GatewayError::Connect { .. })));
        assert!(matches!(b, Err(GatewayError::Connect { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(cell.current().is_none());

        let conn = cell
            .get_or_connect(connector(&attempts, false))
            .await
            .unwrap();
        assert_eq!(conn.0, 2);
    }

    #[tokio::test]
    async fn test_invalidate_only_clears_matching_connection() {
        let cell = ConnectionCell::<Conn>::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let first = cell
            .get_or_connect(connector(&attempts, false))
            .await
            .unwrap();
        assert!(cell.invalidate(&first));
        assert!(cell.current().is_none());

        let second = cell
            .get_or_connect(connector(&attempts, false))
            .await
            .unwrap();
        assert!(!cell.invalidate(&first));
        assert!(Arc::ptr_eq(&cell.current().unwrap(), &second));
    }

    #[tokio::test]
    async fn test_take_is_idempotent() {
        let cell = ConnectionCell::<Conn>::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let conn = cell
            .get_or_connect(connector(&attempts, false))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&cell.take().unwrap(), &conn));
        assert!(cell.take().is_none());
        assert!(cell.current().is_none());
    }
}
