use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::envelope::{Envelope, KEEPALIVE_QUALIFIER};
use crate::error::GatewayError;

/// A connection that can be kept alive with heartbeats.
#[async_trait]
pub trait KeepaliveTarget: Send + Sync + 'static {
    /// Time since the last frame was sent or received.
    fn idle_for(&self) -> Duration;

    fn is_closed(&self) -> bool;

    /// Send one heartbeat through the normal request/response path.
    async fn ping(&self, heartbeat: Envelope) -> Result<Envelope, GatewayError>;
}

/// The heartbeat request.
pub fn heartbeat() -> Envelope {
    Envelope::builder().qualifier(KEEPALIVE_QUALIFIER).build()
}

/// Send a heartbeat on `target` every `interval` it has been idle.
///
/// Heartbeat results are only logged. The task ends once the target is dropped or closed.
pub fn spawn_keepalive<T: KeepaliveTarget>(interval: Duration, target: Weak<T>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(target) = target.upgrade() else {
                break;
            };
            if target.is_closed() {
                break;
            }
            if target.idle_for() < interval {
                continue;
            }

            match target.ping(heartbeat()).await {
                Ok(reply) => {
                    trace!("Keepalive acknowledged");
                    reply.release();
                }
                Err(error) => debug!(%error, "Keepalive failed"),
            }
        }

        trace!("Keepalive task finished");
    })
}
