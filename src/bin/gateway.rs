use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use gateway_transport::server::{
    EnvelopeResult, GatewayAcceptorConfig, Invocation, ServiceInvoker, WebsocketGatewayAcceptor,
};
use gateway_transport::{Envelope, GatewayError};
use serde_json::{Value, json};
use tracing::info;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Echo services for trying out clients.
struct EchoService;

fn reply(value: Value) -> EnvelopeResult {
    Ok(Envelope::builder()
        .payload(Bytes::from(value.to_string()))
        .build())
}

impl ServiceInvoker for EchoService {
    fn invoke(&self, request: Envelope) -> Invocation {
        let body: Value = request
            .payload()
            .and_then(|payload| serde_json::from_slice(payload).ok())
            .unwrap_or(Value::Null);

        match request.qualifier() {
            Some("/echo/one") => {
                let payload = request.payload().cloned();
                Invocation::one(async move { Ok(Envelope::builder().maybe_payload(payload).build()) })
            }
            Some("/echo/many") => {
                let count = body["count"].as_u64().unwrap_or(3);
                let every = Duration::from_millis(body["every_ms"].as_u64().unwrap_or(100));
                Invocation::many(
                    futures::stream::iter(0..count)
                        .then(move |index| async move {
                            tokio::time::sleep(every).await;
                            reply(json!({ "index": index }))
                        }),
                )
            }
            Some("/echo/fail") => {
                let message = body["message"].as_str().unwrap_or("requested failure");
                Invocation::failed(GatewayError::bad_request(message))
            }
            Some(other) => Invocation::failed(GatewayError::bad_request(format!(
                "no service for '{other}'"
            ))),
            None => Invocation::failed(GatewayError::bad_request("request has no qualifier")),
        }
    }

    fn invoke_channel(
        &self,
        requests: BoxStream<'static, Envelope>,
    ) -> BoxStream<'static, EnvelopeResult> {
        requests
            .map(|request| Ok(Envelope::builder().maybe_payload(request.payload().cloned()).build()))
            .boxed()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let addr: SocketAddr = std::env::var("GATEWAY_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()?;

    let config = GatewayAcceptorConfig::builder().bind_address(addr).build();
    let handle = WebsocketGatewayAcceptor::new(config, Arc::new(EchoService))
        .spawn()
        .await?;
    info!(addr = %handle.local_addr(), "Gateway ready");

    tokio::signal::ctrl_c().await?;
    info!(
        sessions = handle.active_sessions(),
        streams = handle.active_streams(),
        "Shutting down"
    );
    handle.shutdown().await;

    Ok(())
}
