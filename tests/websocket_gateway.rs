mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gateway_transport::client::{GatewayClient, GatewayClientConfig, WebsocketGatewayClient};
use gateway_transport::server::{GatewayAcceptorConfig, GatewayHandle, WebsocketGatewayAcceptor};
use gateway_transport::{DefaultErrorMapper, Envelope, ErrorData, ErrorMapper, GatewayError};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{EchoService, TIMEOUT, parse, request};

async fn start() -> GatewayHandle {
    WebsocketGatewayAcceptor::new(GatewayAcceptorConfig::default(), Arc::new(EchoService))
        .spawn()
        .await
        .unwrap()
}

fn client_for(handle: &GatewayHandle) -> WebsocketGatewayClient {
    WebsocketGatewayClient::new(
        GatewayClientConfig::builder()
            .port(handle.local_addr().port())
            .build(),
    )
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_request_response() {
    let handle = start().await;
    let client = client_for(&handle);

    let response = client
        .request_response(request("/echo/one", json!({ "text": "hello" })))
        .await
        .unwrap();
    assert_eq!(parse(&response), json!({ "text": "hello" }));
    assert_eq!(client.pending_streams(), 0);

    client.close().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_stream_of_values_completes() {
    let handle = start().await;
    let client = client_for(&handle);

    let responses: Vec<_> = tokio::time::timeout(
        TIMEOUT,
        client
            .request_stream(request("/echo/many", json!({ "count": 3 })))
            .collect::<Vec<_>>(),
    )
    .await
    .unwrap();

    let indexes: Vec<_> = responses
        .into_iter()
        .map(|response| parse(&response.unwrap())["index"].clone())
        .collect();
    assert_eq!(indexes, vec![json!(0), json!(1), json!(2)]);

    assert_eq!(client.pending_streams(), 0);
    eventually(|| handle.active_streams() == 0).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_dropping_stream_cancels_invocation() {
    let handle = start().await;
    let client = client_for(&handle);

    let mut ticks = client.request_stream(request("/echo/ticks", json!({})));
    let first = tokio::time::timeout(TIMEOUT, ticks.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(parse(&first)["tick"], json!(0));
    assert_eq!(handle.active_streams(), 1);

    drop(ticks);

    assert_eq!(client.pending_streams(), 0);
    eventually(|| handle.active_streams() == 0).await;
    assert!(client.is_connected());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_service_errors_use_default_mapping() {
    let handle = start().await;
    let client = client_for(&handle);

    let result = client
        .request_response(request("/echo/fail", json!({ "code": 403, "message": "denied" })))
        .await;
    match result {
        Err(GatewayError::Forbidden { code, message }) => {
            assert_eq!(code, 403);
            assert_eq!(message, "denied");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let mut responses = client.request_stream(request("/unknown", json!({})));
    assert!(matches!(
        responses.next().await,
        Some(Err(GatewayError::BadRequest { .. }))
    ));
    assert!(responses.next().await.is_none());

    handle.shutdown().await;
}

#[derive(Debug, thiserror::Error)]
#[error("quota exceeded: {0}")]
struct QuotaExceeded(String);

#[derive(Debug)]
struct QuotaMapper;

impl ErrorMapper for QuotaMapper {
    fn to_error(&self, envelope: &Envelope) -> GatewayError {
        let data = ErrorData::from_envelope(envelope);
        if data.error_code == 4290 {
            GatewayError::custom(QuotaExceeded(data.error_message))
        } else {
            DefaultErrorMapper.to_error(envelope)
        }
    }

    fn to_error_data(&self, error: &GatewayError) -> ErrorData {
        DefaultErrorMapper.to_error_data(error)
    }
}

#[tokio::test]
async fn test_custom_mapper_produces_custom_error() {
    let handle = start().await;
    let client = WebsocketGatewayClient::new(
        GatewayClientConfig::builder()
            .port(handle.local_addr().port())
            .error_mapper(Arc::new(QuotaMapper))
            .build(),
    );

    let result = client
        .request_response(request("/echo/fail", json!({ "code": 4290, "message": "slow down" })))
        .await;

    let Err(GatewayError::Custom(error)) = result else {
        panic!("expected a custom error, got {result:?}");
    };
    let quota = error.downcast_ref::<QuotaExceeded>().unwrap();
    assert_eq!(quota.0, "slow down");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_connection_drop_fails_all_streams_and_reconnects() {
    let handle = start().await;
    let client = client_for(&handle);

    let mut streams = Vec::new();
    for _ in 0..3 {
        let mut ticks = client.request_stream(request("/echo/ticks", json!({})));
        let first = tokio::time::timeout(TIMEOUT, ticks.next()).await.unwrap();
        assert!(matches!(first, Some(Ok(_))));
        streams.push(ticks);
    }
    assert_eq!(client.pending_streams(), 3);

    assert_eq!(handle.disconnect_all(), 1);

    for mut ticks in streams {
        let error = tokio::time::timeout(TIMEOUT, async {
            loop {
                match ticks.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => break error,
                    None => panic!("stream ended without an error"),
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(error, GatewayError::ConnectionClosed));
    }

    let response = client
        .request_response(request("/echo/one", json!("again")))
        .await
        .unwrap();
    assert_eq!(parse(&response), json!("again"));
    eventually(|| handle.active_sessions() == 1).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_close_then_reconnect() {
    let handle = start().await;
    let client = client_for(&handle);

    client
        .request_response(request("/echo/one", json!(1)))
        .await
        .unwrap();
    eventually(|| handle.active_sessions() == 1).await;

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(!client.is_connected());
    eventually(|| handle.active_sessions() == 0).await;

    let response = client
        .request_response(request("/echo/one", json!(2)))
        .await
        .unwrap();
    assert_eq!(parse(&response), json!(2));
    assert!(client.is_connected());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let handle = start().await;
    let client = Arc::new(client_for(&handle));

    let calls = (0..8).map(|i| {
        let client = client.clone();
        async move {
            client
                .request_response(request("/echo/one", json!(i)))
                .await
                .map(|response| parse(&response))
        }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i));
    }
    assert_eq!(handle.active_sessions(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_survives_keepalive() {
    let handle = start().await;
    let client = WebsocketGatewayClient::new(
        GatewayClientConfig::builder()
            .port(handle.local_addr().port())
            .keepalive_interval(Duration::from_millis(20))
            .build(),
    );

    client
        .request_response(request("/echo/one", json!("first")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(client.is_connected());
    assert_eq!(client.pending_streams(), 0);
    let response = client
        .request_response(request("/echo/one", json!("second")))
        .await
        .unwrap();
    assert_eq!(parse(&response), json!("second"));

    handle.shutdown().await;
}
