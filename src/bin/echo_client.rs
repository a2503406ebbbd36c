use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use gateway_transport::client::{GatewayClient, GatewayClientConfig, WebsocketGatewayClient};
use gateway_transport::{Envelope, GatewayError};
use serde_json::json;
use tracing::{info, warn};

fn text(envelope: &Envelope) -> String {
    envelope
        .payload()
        .map(|payload| String::from_utf8_lossy(payload).into_owned())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let host = std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("GATEWAY_PORT")
        .ok()
        .map(|port| port.parse())
        .transpose()?
        .unwrap_or(8080);

    let config = GatewayClientConfig::builder()
        .host(host)
        .port(port)
        .keepalive_interval(Duration::from_secs(15))
        .build();
    info!(endpoint = %config.endpoint(), "Connecting");
    let client = WebsocketGatewayClient::new(config);

    let request = Envelope::builder()
        .qualifier("/echo/one")
        .payload(Bytes::from(json!({ "text": "hello" }).to_string()))
        .build();
    let response = client.request_response(request).await?;
    info!(payload = %text(&response), "Echoed");

    let request = Envelope::builder()
        .qualifier("/echo/many")
        .payload(Bytes::from(json!({ "count": 5 }).to_string()))
        .build();
    let mut responses = client.request_stream(request);
    while let Some(response) = responses.next().await {
        let response = response?;
        info!(payload = %text(&response), "Streamed");
    }

    let request = Envelope::builder()
        .qualifier("/echo/fail")
        .payload(Bytes::from(json!({ "message": "on purpose" }).to_string()))
        .build();
    match client.request_response(request).await {
        Err(GatewayError::BadRequest { code, message }) => {
            info!(code, message = %message, "Failure came back as expected")
        }
        other => warn!(result = ?other, "Unexpected result"),
    }

    client.close().await?;
    Ok(())
}
