//! Websocket source integration tests
//!
//! Each test runs a throwaway Doppler stand-in on a local port that checks
//! the `Authorization` header and pushes whatever frames the test feeds it.

use firehose_nozzle::{
    Config, Consumer, Envelope, EventSource, EventType, SlowConsumerAlert, TransportError,
    WebSocketSource, CLOSE_POLICY_VIOLATION, TRUNCATION_COUNTER, TRUNCATION_ORIGIN,
};
use futures::SinkExt;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const AUTH_TOKEN: &str = "bearer n98ubNOIUog9gOPUbvqiur";
const SUBSCRIPTION: &str = "test-nozzle-A";
const WAIT: Duration = Duration::from_secs(5);

/// Start a fake Doppler; returns its ws:// address and a frame feed
async fn doppler_server() -> (String, mpsc::Sender<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut rx) = mpsc::channel::<Message>(16);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let check = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let authorized = req
                .headers()
                .get("authorization")
                .is_some_and(|v| v == AUTH_TOKEN);
            let expected_path = format!("/firehose/{}", SUBSCRIPTION);
            if authorized && req.uri().path() == expected_path {
                Ok(resp)
            } else {
                Err(Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .body(None)
                    .unwrap())
            }
        };

        let mut ws = match tokio_tungstenite::accept_hdr_async(stream, check).await {
            Ok(ws) => ws,
            Err(_) => return,
        };

        while let Some(msg) = rx.recv().await {
            if ws.send(msg).await.is_err() {
                return;
            }
        }
        let _ = ws.close(None).await;
    });

    (format!("ws://{}", addr), tx)
}

fn policy_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Policy,
        reason: "consumer too slow".into(),
    }))
}

// ─── Source ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_source_decodes_binary_frames() {
    let (addr, frames) = doppler_server().await;
    let mut source = WebSocketSource::new(addr, AUTH_TOKEN, SUBSCRIPTION).unwrap();
    let mut streams = source.start(CancellationToken::new()).unwrap();

    let message = "Hello from fake loggregator";
    let env = Envelope::log("fake-origin-1", "my-app-guid", message, 1_700_000_000);
    frames.send(Message::Binary(env.to_frame())).await.unwrap();

    let received = timeout(WAIT, streams.events.recv()).await.unwrap().unwrap();
    assert_eq!(received.kind(), Some(EventType::LogMessage));
    assert_eq!(
        received.log_message.unwrap().message.as_deref(),
        Some(message.as_bytes())
    );
}

#[tokio::test]
async fn test_source_reports_undecodable_frame() {
    let (addr, frames) = doppler_server().await;
    let mut source = WebSocketSource::new(addr, AUTH_TOKEN, SUBSCRIPTION).unwrap();
    let mut streams = source.start(CancellationToken::new()).unwrap();

    frames.send(Message::Binary(vec![0xff, 0xff, 0xff])).await.unwrap();

    let err = timeout(WAIT, streams.errors.recv()).await.unwrap().unwrap();
    assert!(matches!(err, TransportError::Decode(_)));
}

#[tokio::test]
async fn test_source_rejected_token() {
    let (addr, _frames) = doppler_server().await;
    let mut source = WebSocketSource::new(addr, "bearer wrong", SUBSCRIPTION).unwrap();
    let mut streams = source.start(CancellationToken::new()).unwrap();

    let err = timeout(WAIT, streams.errors.recv()).await.unwrap().unwrap();
    assert_eq!(err, TransportError::Handshake { status: 401 });
    assert!(timeout(WAIT, streams.events.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_source_reports_close_code() {
    let (addr, frames) = doppler_server().await;
    let mut source = WebSocketSource::new(addr, AUTH_TOKEN, SUBSCRIPTION).unwrap();
    let mut streams = source.start(CancellationToken::new()).unwrap();

    frames.send(policy_close()).await.unwrap();

    let err = timeout(WAIT, streams.errors.recv()).await.unwrap().unwrap();
    assert_eq!(err.close_code(), Some(CLOSE_POLICY_VIOLATION));
}

#[tokio::test]
async fn test_source_cancel_closes_streams() {
    let (addr, frames) = doppler_server().await;
    let mut source = WebSocketSource::new(addr, AUTH_TOKEN, SUBSCRIPTION).unwrap();
    let token = CancellationToken::new();
    let mut streams = source.start(token.clone()).unwrap();

    frames
        .send(Message::Binary(Envelope::counter("metron", "c", 1).to_frame()))
        .await
        .unwrap();
    timeout(WAIT, streams.events.recv()).await.unwrap().unwrap();

    token.cancel();

    assert!(timeout(WAIT, streams.events.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, streams.errors.recv()).await.unwrap().is_none());
}

// ─── Consumer over websocket ─────────────────────────────────────

#[tokio::test]
async fn test_consumer_detects_slow_consumer_over_websocket() {
    let (addr, frames) = doppler_server().await;
    let config = Config::new(addr, SUBSCRIPTION).with_token(AUTH_TOKEN);
    let mut consumer = Consumer::connect(config).await.unwrap();
    consumer.start().unwrap();

    let mut events = consumer.events().unwrap();
    let mut alerts = consumer.alerts().unwrap();
    let mut errors = consumer.errors().unwrap();

    let truncated = Envelope::counter(TRUNCATION_ORIGIN, TRUNCATION_COUNTER, 42);
    frames.send(Message::Binary(truncated.to_frame())).await.unwrap();

    assert_eq!(timeout(WAIT, events.recv()).await.unwrap().unwrap(), truncated);
    assert_eq!(
        timeout(WAIT, alerts.recv()).await.unwrap().unwrap(),
        SlowConsumerAlert::DroppedMessages { dropped: 42 }
    );

    frames.send(policy_close()).await.unwrap();

    let err = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(err.close_code(), Some(CLOSE_POLICY_VIOLATION));
    assert!(matches!(
        timeout(WAIT, alerts.recv()).await.unwrap().unwrap(),
        SlowConsumerAlert::PolicyViolation { .. }
    ));

    consumer.close().unwrap();
}
