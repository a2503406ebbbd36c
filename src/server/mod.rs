//! The gateway side: accepts connections, decodes frames and dispatches them to services.
//!
//! [`GatewaySession`] holds the stream registry of one multiplexed connection and is shared by
//! every binding that frames streams itself. [`NativeGatewayAcceptor`] serves transports that
//! multiplex natively, opening one [`NativeGatewaySession`] per connection with no registry.

mod config;
mod invoker;
mod native;
mod session;
mod websocket;

pub use config::GatewayAcceptorConfig;
pub use invoker::{EnvelopeResult, Invocation, ServiceInvoker};
pub use native::{NativeGatewayAcceptor, NativeGatewaySession};
pub use session::{GatewaySession, GatewaySessionHandler, NoopSessionHandler, SessionId};
pub use websocket::{GatewayHandle, WebsocketGatewayAcceptor};
