#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use gateway_transport::server::{EnvelopeResult, Invocation, ServiceInvoker};
use gateway_transport::{Envelope, GatewayError};
use serde_json::{Value, json};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Echo services used across the binding tests.
///
/// - `/echo/one` answers with the request payload
/// - `/echo/many` answers `{"index": i}` for `i` in `0..count`
/// - `/echo/ticks` answers `{"tick": i}` every 10ms until cancelled
/// - `/echo/fail` fails with the code and message in its payload
pub struct EchoService;

pub fn json_payload(value: Value) -> Bytes {
    Bytes::from(value.to_string())
}

pub fn parse(envelope: &Envelope) -> Value {
    envelope
        .payload()
        .map(|payload| serde_json::from_slice(payload).unwrap())
        .unwrap_or(Value::Null)
}

pub fn request(qualifier: &str, payload: Value) -> Envelope {
    Envelope::builder()
        .qualifier(qualifier)
        .payload(json_payload(payload))
        .build()
}

fn reply(value: Value) -> EnvelopeResult {
    Ok(Envelope::builder().payload(json_payload(value)).build())
}

impl ServiceInvoker for EchoService {
    fn invoke(&self, request: Envelope) -> Invocation {
        let body = parse(&request);
        match request.qualifier() {
            Some("/echo/one") => {
                let payload = request.payload().cloned();
                Invocation::one(async move { Ok(Envelope::builder().maybe_payload(payload).build()) })
            }
            Some("/echo/many") => {
                let count = body["count"].as_u64().unwrap_or(3);
                Invocation::many(futures::stream::iter((0..count).map(|i| reply(json!({ "index": i })))))
            }
            Some("/echo/ticks") => Invocation::many(
                futures::stream::unfold(0u64, |tick| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Some((reply(json!({ "tick": tick })), tick + 1))
                }),
            ),
            Some("/echo/fail") => {
                let code = body["code"].as_i64().unwrap_or(500) as i32;
                let message = body["message"].as_str().unwrap_or("failed").to_string();
                Invocation::failed(match code {
                    400 => GatewayError::bad_request(message),
                    401 => GatewayError::Unauthorized { code, message },
                    403 => GatewayError::Forbidden { code, message },
                    503 => GatewayError::ServiceUnavailable { code, message },
                    _ => GatewayError::InternalService { code, message },
                })
            }
            _ => Invocation::failed(GatewayError::bad_request("unknown service")),
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
