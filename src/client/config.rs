use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use url::Url;

use crate::error::{ErrorMapper, GatewayError, default_error_mapper};

/// Configuration shared by the gateway client bindings.
///
/// Immutable once built.
#[derive(Debug, Clone, Builder)]
pub struct GatewayClientConfig {
    #[builder(into, default = "127.0.0.1".to_string())]
    pub host: String,

    #[builder(default = 8080)]
    pub port: u16,

    /// Path of the WebSocket endpoint. Unused by the other bindings.
    #[builder(into, default = "/".to_string())]
    pub path: String,

    /// Use `wss`/`https` instead of `ws`/`http`.
    #[builder(default = false)]
    pub secure: bool,

    /// Content type of request payloads.
    #[builder(into, default = "application/json".to_string())]
    pub content_type: String,

    /// Whether the HTTP binding follows redirects.
    #[builder(default = true)]
    pub follow_redirect: bool,

    /// Heartbeat interval for idle WebSocket connections. No heartbeat when unset.
    pub keepalive_interval: Option<Duration>,

    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,

    /// Frames queued per connection before callers wait for the writer.
    #[builder(default = 256)]
    pub outbound_capacity: usize,

    /// Turns error responses into [`GatewayError`]s.
    #[builder(default = default_error_mapper())]
    pub error_mapper: Arc<dyn ErrorMapper>,
}

impl GatewayClientConfig {
    /// The WebSocket endpoint, e.g. `ws://127.0.0.1:8080/`.
    pub fn websocket_url(&self) -> Result<Url, GatewayError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        self.url(scheme, &self.path)
    }

    /// The HTTP endpoint for a qualifier, e.g. `http://127.0.0.1:8080/echo/one`.
    pub fn http_url(&self, qualifier: &str) -> Result<Url, GatewayError> {
        let scheme = if self.secure { "https" } else { "http" };
        self.url(scheme, qualifier)
    }

    /// `host:port`, for logs and errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn url(&self, scheme: &str, path: &str) -> Result<Url, GatewayError> {
        let path = path.trim_start_matches('/');
        let raw = format!("{scheme}://{}:{}/{path}", self.host, self.port);
        Url::parse(&raw).map_err(|e| GatewayError::Connect {
            endpoint: self.endpoint(),
            reason: format!("invalid url '{raw}': {e}"),
        })
    }
}

impl Default for GatewayClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayClientConfig::default();
        assert_eq!(config.endpoint(), "127.0.0.1:8080");
        assert_eq!(config.content_type, "application/json");
        assert!(config.follow_redirect);
        assert!(config.keepalive_interval.is_none());
    }

    #[test]
    fn test_urls_follow_secure_switch() {
        let config = GatewayClientConfig::builder()
            .host("gateway.local")
            .port(9000)
            .path("/ws")
            .build();
        assert_eq!(config.websocket_url().unwrap().as_str(), "ws://gateway.local:9000/ws");
        assert_eq!(
            config.http_url("/echo/one").unwrap().as_str(),
            "http://gateway.local:9000/echo/one"
        );

        let secure = GatewayClientConfig::builder().secure(true).build();
        assert_eq!(secure.websocket_url().unwrap().scheme(), "wss");
        assert_eq!(secure.http_url("x").unwrap().scheme(), "https");
    }

    #[test]
    fn test_invalid_host_is_connect_error() {
        let config = GatewayClientConfig::builder().host("bad host").build();
        assert!(matches!(
            config.websocket_url(),
            Err(GatewayError::Connect { .. })
        ));
    }
}
