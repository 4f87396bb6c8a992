use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use firehose_nozzle::firehose::{ConsumerError, Envelope, Event, Firehose, WebsocketFirehose};

const SECOND: i64 = 1_000_000_000;

#[derive(Debug, Default, Clone)]
struct Handshake {
    path: String,
    authorization: Option<String>,
}

/// Accepts one websocket client, sends `frames`, then keeps the connection
/// open for `linger`.
async fn traffic_controller(
    frames: Vec<Message>,
    linger: Duration,
) -> (SocketAddr, Arc<Mutex<Handshake>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handshake = Arc::new(Mutex::new(Handshake::default()));
    let seen = Arc::clone(&handshake);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let mut seen = seen.lock();
            seen.path = req.uri().path().to_string();
            seen.authorization = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .expect("handshake");

        for frame in frames {
            if ws.send(frame).await.is_err() {
                return;
            }
        }

        let _ = tokio::time::timeout(linger, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
    });

    (addr, handshake)
}

fn binary(envelope: Envelope) -> Message {
    Message::Binary(envelope.encode_to_vec().into())
}

fn close(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

#[tokio::test]
async fn test_streams_envelopes_until_policy_close() {
    let frames = vec![
        binary(
            Envelope::value_metric("rep", "CapacityRemainingMemory", 1024.0, 10 * SECOND)
                .with_source("cf", "diego_cell", "0", "10.0.16.5"),
        ),
        binary(Envelope::counter_event(
            "doppler",
            "TruncatingBuffer.DroppedMessages",
            3,
            9,
            11 * SECOND,
        )),
        close(
            CloseCode::Policy,
            "Client did not respond to ping before keep-alive timeout expired.",
        ),
    ];
    let (addr, handshake) = traffic_controller(frames, Duration::from_secs(1)).await;

    let mut firehose = WebsocketFirehose::new(&format!("ws://{addr}"), false);
    let mut sub = firehose
        .subscribe("firehose-a", "bearer 123456789")
        .await
        .expect("subscribe");

    let first = sub.messages.recv().await.expect("first envelope");
    assert_eq!(first.origin, "rep");
    assert_eq!(first.job, "diego_cell");
    assert!(matches!(&first.event, Event::ValueMetric(m) if m.value == 1024.0));

    let second = sub.messages.recv().await.expect("second envelope");
    assert!(matches!(&second.event, Event::CounterEvent(c) if c.total == 9));

    let err = (&mut sub.errors).await.expect("terminal error");
    assert_eq!(err.close_code(), Some(1008));
    assert!(err.to_string().starts_with("websocket: close 1008"));

    let handshake = handshake.lock().clone();
    assert_eq!(handshake.path, "/firehose/firehose-a");
    assert_eq!(handshake.authorization.as_deref(), Some("bearer 123456789"));
}

#[tokio::test]
async fn test_empty_token_sends_no_authorization_header() {
    let frames = vec![close(CloseCode::Normal, "")];
    let (addr, handshake) = traffic_controller(frames, Duration::from_secs(1)).await;

    let mut firehose = WebsocketFirehose::new(&format!("ws://{addr}/"), false);
    let mut sub = firehose.subscribe("nozzle", "").await.expect("subscribe");

    let err = (&mut sub.errors).await.expect("terminal error");
    assert_eq!(err.close_code(), Some(1000));
    assert_eq!(handshake.lock().authorization, None);
}

#[tokio::test]
async fn test_skips_text_and_undecodable_frames() {
    let frames = vec![
        Message::Text("hello".into()),
        Message::Binary(vec![0xff, 0xff, 0xff].into()),
        binary(Envelope::value_metric("gorouter", "latency", 12.5, 3 * SECOND)),
        close(CloseCode::Normal, "done"),
    ];
    let (addr, _) = traffic_controller(frames, Duration::from_secs(1)).await;

    let mut firehose = WebsocketFirehose::new(&format!("ws://{addr}"), false);
    let mut sub = firehose.subscribe("nozzle", "").await.expect("subscribe");

    let envelope = sub.messages.recv().await.expect("envelope");
    assert_eq!(envelope.origin, "gorouter");

    let err = (&mut sub.errors).await.expect("terminal error");
    assert_eq!(err.close_code(), Some(1000));
    assert!(sub.messages.try_recv().is_err());
}

#[tokio::test]
async fn test_idle_timeout_ends_subscription() {
    let (addr, _) = traffic_controller(Vec::new(), Duration::from_secs(10)).await;

    let mut firehose = WebsocketFirehose::new(&format!("ws://{addr}"), false);
    firehose.set_idle_timeout(Duration::from_millis(200));
    let mut sub = firehose.subscribe("nozzle", "").await.expect("subscribe");

    let err = tokio::time::timeout(Duration::from_secs(5), &mut sub.errors)
        .await
        .expect("timeout fired")
        .expect("terminal error");

    assert!(matches!(err, ConsumerError::IdleTimeout(_)));
    assert!(err.to_string().contains("i/o timeout"));
}

#[tokio::test]
async fn test_connect_failure_is_reported_on_error_channel() {
    // Bind and release a port so nothing is listening on it.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr")
    };

    let mut firehose = WebsocketFirehose::new(&format!("ws://{addr}"), false);
    let mut sub = firehose.subscribe("nozzle", "").await.expect("subscribe");

    let err = (&mut sub.errors).await.expect("terminal error");
    assert!(matches!(err, ConsumerError::Connect(_)));
    assert_eq!(err.close_code(), None);
}

#[tokio::test]
async fn test_close_stops_reader() {
    let (addr, _) = traffic_controller(Vec::new(), Duration::from_secs(10)).await;

    let mut firehose = WebsocketFirehose::new(&format!("ws://{addr}"), false);
    let mut sub = firehose.subscribe("nozzle", "").await.expect("subscribe");

    // Give the reader a moment to finish the handshake.
    tokio::time::sleep(Duration::from_millis(100)).await;
    sub.close();

    let err = tokio::time::timeout(Duration::from_secs(5), &mut sub.errors)
        .await
        .expect("reader stopped")
        .expect("terminal error");
    assert!(matches!(err, ConsumerError::Cancelled));
}
