use std::net::SocketAddr;
use std::sync::Arc;

use bon::Builder;

use crate::error::{ErrorMapper, default_error_mapper};

/// Configuration for a gateway acceptor.
#[derive(Debug, Clone, Builder)]
pub struct GatewayAcceptorConfig {
    /// Address to listen on. Port 0 picks a free port.
    #[builder(default = SocketAddr::from(([127, 0, 0, 1], 0)))]
    pub bind_address: SocketAddr,

    /// Frames queued per connection before invocations wait for the writer.
    #[builder(default = 256)]
    pub outbound_capacity: usize,

    /// Turns failed invocations into error payloads.
    #[builder(default = default_error_mapper())]
    pub error_mapper: Arc<dyn ErrorMapper>,
}

impl Default for GatewayAcceptorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
