use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use tracing::debug;

use super::config::GatewayClientConfig;
use super::{EnvelopeStream, GatewayClient, check_response, unsupported};
use crate::envelope::{
    Envelope, HEADER_DATA_FORMAT, HEADER_QUALIFIER, HEADER_SIGNAL, HEADER_STREAM_ID,
    error_qualifier,
};
use crate::error::GatewayError;

/// Gateway client over plain HTTP request/response.
///
/// Each request is a `POST` to the path named by its qualifier. HTTP error statuses become
/// error-qualified responses and are surfaced as `Err`. Streams and channels are not supported on
/// this binding.
pub struct HttpGatewayClient {
    config: GatewayClientConfig,
    http: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new(config: GatewayClientConfig) -> Result<Self, GatewayError> {
        let redirect = if config.follow_redirect {
            Policy::default()
        } else {
            Policy::none()
        };

        let http = reqwest::Client::builder()
            .redirect(redirect)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::Connect {
                endpoint: config.endpoint(),
                reason: e.to_string(),
            })?;

        Ok(Self { config, http })
    }

    fn map_send_error(&self, error: reqwest::Error) -> GatewayError {
        if error.is_builder() {
            GatewayError::Encoding(error.to_string())
        } else if error.is_connect() || error.is_timeout() {
            GatewayError::Connect {
                endpoint: self.config.endpoint(),
                reason: error.to_string(),
            }
        } else {
            debug!(error = %error, "HTTP exchange failed");
            GatewayError::ConnectionClosed
        }
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn request_response(&self, request: Envelope) -> Result<Envelope, GatewayError> {
        let Some(qualifier) = request.qualifier().map(str::to_string) else {
            request.release();
            return Err(GatewayError::Encoding("request has no qualifier".to_string()));
        };
        let url = self.config.http_url(&qualifier)?;

        let (headers, payload) = request.into_parts();
        let content_type = headers
            .get(HEADER_DATA_FORMAT)
            .cloned()
            .unwrap_or_else(|| self.config.content_type.clone());

        let mut builder = self
            .http
            .post(url)
            .header(CONTENT_TYPE, content_type);
        for (key, value) in &headers {
            if matches!(
                key.as_str(),
                HEADER_QUALIFIER | HEADER_STREAM_ID | HEADER_SIGNAL | HEADER_DATA_FORMAT
            ) {
                continue;
            }
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(payload) = payload {
            builder = builder.body(payload);
        }

        debug!(qualifier = %qualifier, "Sending HTTP request");
        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        let data_format = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let qualifier = if (400..=599).contains(&status) {
            error_qualifier(i32::from(status))
        } else {
            qualifier
        };

        let mut response = Envelope::builder().qualifier(qualifier);
        if let Some(data_format) = data_format {
            response = response.data_format(data_format);
        }
        if !body.is_empty() {
            response = response.payload(body);
        }

        check_response(self.config.error_mapper.as_ref(), response.build())
    }

    fn request_stream(&self, request: Envelope) -> EnvelopeStream {
        request.release();
        unsupported("request_stream")
    }

    fn request_channel(&self, requests: BoxStream<'static, Envelope>) -> EnvelopeStream {
        drop(requests);
        unsupported("request_channel")
    }

    /// Pooled connections are left to the HTTP client; there is nothing to close.
    async fn close(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_streaming_is_unsupported() {
        let client = HttpGatewayClient::new(GatewayClientConfig::default()).unwrap();

        let mut responses = client.request_stream(Envelope::builder().qualifier("/x").build());
        assert!(matches!(
            responses.next().await,
            Some(Err(GatewayError::UnsupportedOperation("request_stream")))
        ));

        let mut responses = client.request_channel(futures::stream::empty().boxed());
        assert!(matches!(
            responses.next().await,
            Some(Err(GatewayError::UnsupportedOperation("request_channel")))
        ));
    }

    #[tokio::test]
    async fn test_request_without_qualifier_is_rejected() {
        let client = HttpGatewayClient::new(GatewayClientConfig::default()).unwrap();

        let result = client.request_response(Envelope::default()).await;
        assert!(matches!(result, Err(GatewayError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = HttpGatewayClient::new(GatewayClientConfig::default()).unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
    }
}
