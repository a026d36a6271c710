//! End-to-end transport tests against an in-process WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use lib_stream::core::errors::{CollectingErrorSink, StreamError};
use lib_stream::core::{InboundMessage, OutboundEnvelope, SectionKey};
use lib_stream::transport::{ConnectionState, StaticCredential, Transport, TransportConfig, TransportEvent};
use lib_stream::viewport::VirtualElement;
use lib_stream::{StreamClient, StreamClientConfig};

type ServerSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Accepts connections, handing each socket and its request URI to the test.
async fn listen() -> (String, mpsc::UnboundedReceiver<(ServerSocket, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut uri = String::new();
            let accepted = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                uri = req.uri().to_string();
                Ok(resp)
            })
            .await;
            if let Ok(ws) = accepted {
                if tx.send((ws, uri)).is_err() {
                    break;
                }
            }
        }
    });
    (url, rx)
}

fn config(url: &str) -> TransportConfig {
    TransportConfig {
        url: url.to_string(),
        heartbeat_interval: Duration::from_millis(100),
        reconnect_base_delay: Duration::from_millis(50),
        reconnect_max_delay: Duration::from_secs(1),
        ..TransportConfig::default()
    }
}

async fn next_connection(conns: &mut mpsc::UnboundedReceiver<(ServerSocket, String)>) -> (ServerSocket, String) {
    timeout(WAIT, conns.recv()).await.expect("no connection").expect("listener gone")
}

/// Next JSON frame from the client whose action is `action`.
async fn next_action(ws: &mut ServerSocket, action: &str) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["a"] == action {
                return value;
            }
        }
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<TransportEvent>, mut wanted: F) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv()).await.expect("timed out").expect("events closed");
        if wanted(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn connect_is_idempotent_and_heartbeat_flows() {
    let (url, mut conns) = listen().await;
    let sink = Arc::new(CollectingErrorSink::new());
    let transport = Transport::new(
        config(&url),
        Arc::new(StaticCredential::new(Some("secret".into()))),
        sink.clone(),
    );
    let mut events = transport.subscribe();

    transport.connect().unwrap();
    transport.connect().unwrap();
    wait_for(&mut events, |e| *e == TransportEvent::Open).await;
    transport.connect().unwrap();
    assert_eq!(transport.state(), ConnectionState::Open);

    let (mut ws, uri) = next_connection(&mut conns).await;
    assert!(uri.contains("token=secret"), "{uri}");

    let ping = next_action(&mut ws, "ping").await;
    assert!(ping["p"]["ts"].as_i64().unwrap() > 0);

    transport
        .send(OutboundEnvelope::new("discovery.widget.list", json!({})))
        .unwrap();
    let request = next_action(&mut ws, "discovery.widget.list").await;
    assert_eq!(request["p"], json!({}));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(conns.try_recv().is_err(), "a second connection was opened");

    transport.disconnect();
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::Closed { .. })).await,
        TransportEvent::Closed { expected: true }
    );
    assert!(sink.is_empty());
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let (url, mut conns) = listen().await;
    let sink = Arc::new(CollectingErrorSink::new());
    let transport = Transport::new(config(&url), Arc::new(StaticCredential::default()), sink.clone());
    let (tx, mut inbound) = mpsc::unbounded_channel();
    transport.set_message_handler(move |message| {
        let _ = tx.send(message);
    });

    transport.connect().unwrap();
    let (mut ws, _) = next_connection(&mut conns).await;

    ws.send(Message::Text("{bad json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"pong"}"#.into())).await.unwrap();
    ws.send(Message::Text(
        r#"{"type":"page_stream","page_id":"home","viewport_section":"0-500_0-300","modules":[],"widgets":[],"complete":false}"#.into(),
    ))
    .await
    .unwrap();

    let message = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    assert!(matches!(message, InboundMessage::PageStream(ref p) if p.page_id == "home"));
    assert_eq!(transport.state(), ConnectionState::Open);
    assert!(matches!(sink.errors()[..], [StreamError::Parse(_)]));

    transport.disconnect();
}

#[tokio::test]
async fn dropped_connection_reconnects_with_backoff() {
    let (url, mut conns) = listen().await;
    let sink = Arc::new(CollectingErrorSink::new());
    let transport = Transport::new(config(&url), Arc::new(StaticCredential::default()), sink.clone());
    let mut events = transport.subscribe();

    transport.connect().unwrap();
    let (ws, _) = next_connection(&mut conns).await;
    wait_for(&mut events, |e| *e == TransportEvent::Open).await;

    drop(ws);

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::Closed { .. })).await,
        TransportEvent::Closed { expected: false }
    );
    let scheduled = wait_for(&mut events, |e| matches!(e, TransportEvent::ReconnectScheduled { .. })).await;
    assert_eq!(
        scheduled,
        TransportEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_millis(100),
        }
    );

    let (_ws, _) = next_connection(&mut conns).await;
    wait_for(&mut events, |e| *e == TransportEvent::Open).await;
    assert_eq!(transport.reconnect_attempt(), 0);
    assert!(sink.errors().iter().all(StreamError::is_retryable));

    transport.disconnect();
}

#[tokio::test]
async fn unanswered_section_is_requested_again_after_reconnect() {
    let (url, mut conns) = listen().await;
    let sink = Arc::new(CollectingErrorSink::new());
    let client = StreamClient::new(
        StreamClientConfig {
            transport: config(&url),
            ..StreamClientConfig::default()
        },
        Arc::new(StaticCredential::default()),
        sink.clone(),
    );
    let mut events = client.transport().subscribe();

    client.connect().unwrap();
    let (mut first, _) = next_connection(&mut conns).await;
    wait_for(&mut events, |e| *e == TransportEvent::Open).await;

    let element = Arc::new(VirtualElement::new(300.0, 500.0));
    client.tracker().start_tracking("home", element);

    let request = next_action(&mut first, "page.stream").await;
    assert_eq!(request["p"]["page_id"], json!("home"));
    assert_eq!(request["p"]["preload_buffer"], json!(200.0));
    drop(first);

    let (mut second, _) = next_connection(&mut conns).await;
    let again = next_action(&mut second, "page.stream").await;
    assert_eq!(again["p"]["viewport"], request["p"]["viewport"]);

    let response = json!({
        "type": "page_stream",
        "page_id": "home",
        "viewport_section": "0-500_0-300",
        "modules": [{"id": "hero"}],
        "widgets": [{"id": "w1", "ref": "dashboard@Welcome"}],
        "layout": {"totalHeight": 4000},
        "complete": true
    });
    second.send(Message::Text(response.to_string().into())).await.unwrap();

    let key = SectionKey::new(0, 500, 0, 300);
    timeout(WAIT, async {
        while !client.store().has_section("home", &key) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("section never arrived");

    let content = client.tracker().get_viewport_content("home");
    assert_eq!(content.modules, vec![json!({"id": "hero"})]);
    assert!(client.store().is_complete("home"));
    assert_eq!(client.store().get_page_stream("home").unwrap().total_height, 4000.0);

    client.disconnect();
}
