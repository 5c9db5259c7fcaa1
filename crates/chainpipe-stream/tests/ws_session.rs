//! Exercises `WsSession` and `JsonLinesWsConnector` against a local
//! WebSocket server.

use std::time::Duration;

use chainpipe_core::{ConnectError, SourceConfig, SourceConnector};
use chainpipe_stream::{JsonLinesWsConnector, SessionConfig, WsSession};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Accept one client. Records every text frame it sends and replies
/// according to `reply`.
async fn serve<F>(reply: F) -> (String, JoinHandle<Vec<String>>)
where
    F: Fn(&str) -> Vec<String> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let mut received = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let text = text.to_string();
                for out in reply(&text) {
                    if ws.send(Message::Text(out.into())).await.is_err() {
                        return received;
                    }
                }
                received.push(text);
            }
        }
        received
    });
    (format!("ws://{addr}"), handle)
}

#[tokio::test]
async fn request_matches_id_and_queues_notifications() {
    let (url, server) = serve(|text| {
        let req: Value = serde_json::from_str(text).unwrap();
        let id = req["id"].clone();
        vec![
            json!({"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0x1","result":{"n":1}}}).to_string(),
            json!({"jsonrpc":"2.0","id":id,"result":"0xsub"}).to_string(),
        ]
    })
    .await;

    let src = SourceConfig::new("a", "evm", url);
    let mut session = WsSession::connect(&src, SessionConfig::default()).await.unwrap();
    let result = session.request("eth_subscribe", json!(["logs", {}])).await.unwrap();
    assert_eq!(result, json!("0xsub"));

    let queued = session.next_json().await.unwrap();
    assert_eq!(queued["params"]["result"]["n"], 1);

    drop(session);
    let received = server.await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].contains("eth_subscribe"));
}

#[tokio::test]
async fn backlog_overflow_ends_the_session() {
    let (url, _server) = serve(|text| {
        let req: Value = serde_json::from_str(text).unwrap();
        let mut out: Vec<String> = (0..5)
            .map(|n| {
                json!({"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0x1","result":{"n":n}}})
                    .to_string()
            })
            .collect();
        out.push(json!({"jsonrpc":"2.0","id":req["id"],"result":[]}).to_string());
        out
    })
    .await;

    let src = SourceConfig::new("a", "evm", url);
    let cfg = SessionConfig {
        backlog_limit: 3,
        ..Default::default()
    };
    let mut session = WsSession::connect(&src, cfg).await.unwrap();
    let err = session.request("eth_getLogs", json!([{}])).await.unwrap_err();
    match err {
        ConnectError::Failed { reason, .. } => assert!(reason.contains("backlog"), "{reason}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.backlog_len(), 3);
}

#[tokio::test]
async fn backlog_within_limit_is_kept() {
    let (url, _server) = serve(|text| {
        let req: Value = serde_json::from_str(text).unwrap();
        vec![
            json!({"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0x1","result":{"n":1}}}).to_string(),
            json!({"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0x1","result":{"n":2}}}).to_string(),
            json!({"jsonrpc":"2.0","id":req["id"],"result":[]}).to_string(),
        ]
    })
    .await;

    let src = SourceConfig::new("a", "evm", url);
    let cfg = SessionConfig {
        backlog_limit: 2,
        ..Default::default()
    };
    let mut session = WsSession::connect(&src, cfg).await.unwrap();
    assert_eq!(session.request("eth_getLogs", json!([{}])).await.unwrap(), json!([]));
    assert_eq!(session.next_json().await.unwrap()["params"]["result"]["n"], 1);
    assert_eq!(session.next_json().await.unwrap()["params"]["result"]["n"], 2);
}

#[tokio::test]
async fn rpc_error_is_surfaced() {
    let (url, _server) = serve(|text| {
        let req: Value = serde_json::from_str(text).unwrap();
        vec![json!({"jsonrpc":"2.0","id":req["id"],"error":{"code":-32601,"message":"nope"}}).to_string()]
    })
    .await;

    let src = SourceConfig::new("a", "evm", url);
    let mut session = WsSession::connect(&src, SessionConfig::default()).await.unwrap();
    let err = session.request("eth_subscribe", json!([])).await.unwrap_err();
    assert!(matches!(err, ConnectError::Rpc { .. }));
}

#[tokio::test]
async fn jsonl_connector_sends_subscribe_and_streams_frames() {
    let (url, server) = serve(|_| vec![r#"{"n":1}"#.to_string(), r#"{"n":2}"#.to_string()]).await;

    let src = SourceConfig::new("feed", "custom", url).with_option("subscribe", json!({"op": "sub"}));
    let cancel = CancellationToken::new();
    let mut stream = JsonLinesWsConnector::default()
        .connect(&src, None, cancel.clone())
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(&first.payload[..], br#"{"n":1}"#);
    assert_eq!(&second.payload[..], br#"{"n":2}"#);

    cancel.cancel();
    assert!(tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .is_none());

    let received = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    assert_eq!(received, vec![r#"{"op":"sub"}"#.to_string()]);
}

#[tokio::test]
async fn unreachable_endpoint_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let src = SourceConfig::new("a", "evm", format!("ws://{addr}"));
    let cfg = SessionConfig {
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    assert!(WsSession::connect(&src, cfg).await.is_err());
}
