//! Bridge Module Tests

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;

use super::session::{payload_message, pump, setup_topology, BrokerTopology};
use super::{is_clean_disconnect, read_topics, SessionError};

/// An in-process WebSocket pair: (server side, client side).
async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let (server, client) = tokio::join!(
        tokio_tungstenite::accept_async(server_io),
        tokio_tungstenite::client_async("ws://bridge.test/", client_io),
    );
    (server.unwrap(), client.unwrap().0)
}

fn fake_amqp_error(msg: &str) -> lapin::Error {
    lapin::Error::IOError(Arc::new(io::Error::other(msg.to_string())))
}

// =============================================================================
// Negotiation
// =============================================================================

#[tokio::test]
async fn test_negotiate_reads_topic_list() {
    let (mut server, mut client) = ws_pair().await;

    client
        .send(Message::Text(r#"["orders.created", "orders.#"]"#.to_string()))
        .await
        .unwrap();

    let topics = read_topics(&mut server).await.unwrap();
    assert_eq!(topics, vec!["orders.created".to_string(), "orders.#".to_string()]);
}

#[tokio::test]
async fn test_negotiate_accepts_binary_frame() {
    let (mut server, mut client) = ws_pair().await;

    client
        .send(Message::Binary(br#"["audit.*"]"#.to_vec()))
        .await
        .unwrap();

    let topics = read_topics(&mut server).await.unwrap();
    assert_eq!(topics, vec!["audit.*".to_string()]);
}

#[tokio::test]
async fn test_negotiate_accepts_empty_list() {
    let (mut server, mut client) = ws_pair().await;

    client.send(Message::Text("[]".to_string())).await.unwrap();

    let topics = read_topics(&mut server).await.unwrap();
    assert!(topics.is_empty());
}

#[tokio::test]
async fn test_negotiate_skips_control_frames() {
    let (mut server, mut client) = ws_pair().await;

    client.send(Message::Ping(Vec::new())).await.unwrap();
    client
        .send(Message::Text(r#"["metrics.cpu"]"#.to_string()))
        .await
        .unwrap();

    let topics = read_topics(&mut server).await.unwrap();
    assert_eq!(topics, vec!["metrics.cpu".to_string()]);
}

#[tokio::test]
async fn test_negotiate_rejects_malformed_frame() {
    let (mut server, mut client) = ws_pair().await;

    client
        .send(Message::Text("not a json list".to_string()))
        .await
        .unwrap();

    let err = read_topics(&mut server).await.unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_negotiate_rejects_non_string_entries() {
    let (mut server, mut client) = ws_pair().await;

    client
        .send(Message::Text("[1, 2, 3]".to_string()))
        .await
        .unwrap();

    let err = read_topics(&mut server).await.unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));
}

#[tokio::test]
async fn test_negotiate_rejects_close_before_topics() {
    let (mut server, mut client) = ws_pair().await;

    client.close(None).await.unwrap();

    let err = read_topics(&mut server).await.unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));
}

// =============================================================================
// Topology setup
// =============================================================================

#[derive(Default)]
struct FakeTopology {
    ops: Mutex<Vec<String>>,
    fail_on_bind: Option<&'static str>,
}

impl FakeTopology {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerTopology for FakeTopology {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), lapin::Error> {
        self.ops.lock().unwrap().push(format!("exchange:{}", exchange));
        Ok(())
    }

    async fn declare_queue(&self) -> Result<String, lapin::Error> {
        self.ops.lock().unwrap().push("queue".to_string());
        Ok("amq.gen-fake".to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        topic: &str,
    ) -> Result<(), lapin::Error> {
        if Some(topic) == self.fail_on_bind {
            return Err(fake_amqp_error("bind refused"));
        }
        self.ops
            .lock()
            .unwrap()
            .push(format!("bind:{}:{}:{}", queue, exchange, topic));
        Ok(())
    }
}

#[tokio::test]
async fn test_topology_one_binding_per_topic_after_queue() {
    let topology = FakeTopology::default();
    let topics = vec![
        "orders.created".to_string(),
        "orders.#".to_string(),
        "audit.*".to_string(),
    ];

    let queue = setup_topology(&topology, "events", &topics).await.unwrap();

    assert_eq!(queue, "amq.gen-fake");
    assert_eq!(
        topology.ops(),
        vec![
            "exchange:events".to_string(),
            "queue".to_string(),
            "bind:amq.gen-fake:events:orders.created".to_string(),
            "bind:amq.gen-fake:events:orders.#".to_string(),
            "bind:amq.gen-fake:events:audit.*".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_topology_empty_topicset_creates_no_bindings() {
    let topology = FakeTopology::default();

    setup_topology(&topology, "events", &[]).await.unwrap();

    assert_eq!(
        topology.ops(),
        vec!["exchange:events".to_string(), "queue".to_string()]
    );
}

#[tokio::test]
async fn test_topology_bind_failure_stops_early() {
    let topology = FakeTopology {
        fail_on_bind: Some("b"),
        ..Default::default()
    };
    let topics = vec!["a".to_string(), "b".to_string(), "c".to_string()];

    let err = setup_topology(&topology, "events", &topics).await.unwrap_err();

    assert!(matches!(err, lapin::Error::IOError(_)));
    // The failing bind stops the setup; "c" is never attempted.
    assert_eq!(
        topology.ops(),
        vec![
            "exchange:events".to_string(),
            "queue".to_string(),
            "bind:amq.gen-fake:events:a".to_string(),
        ]
    );
}

// =============================================================================
// Streaming loop
// =============================================================================

#[tokio::test]
async fn test_pump_forwards_deliveries_in_order() {
    let (mut server, mut client) = ws_pair().await;

    let payloads: Vec<Result<Vec<u8>, lapin::Error>> = vec![
        Ok(b"one".to_vec()),
        Ok(b"two".to_vec()),
        Ok(b"three".to_vec()),
    ];
    let deliveries = stream::iter(payloads).chain(stream::pending());

    let session = tokio::spawn(async move {
        pump(&mut server, deliveries, Duration::from_secs(60)).await
    });

    for expected in ["one", "two", "three"] {
        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Text(expected.to_string()));
    }

    client.close(None).await.unwrap();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_pump_peer_close_ends_cleanly() {
    let (mut server, mut client) = ws_pair().await;
    let deliveries = stream::pending::<Result<Vec<u8>, lapin::Error>>();

    let session = tokio::spawn(async move {
        pump(&mut server, deliveries, Duration::from_secs(60)).await
    });

    client.close(None).await.unwrap();
    session.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pump_pings_every_period_with_no_deliveries() {
    let (mut server, mut client) = ws_pair().await;
    let deliveries = stream::pending::<Result<Vec<u8>, lapin::Error>>();

    let session = tokio::spawn(async move {
        pump(&mut server, deliveries, Duration::from_secs(60)).await
    });

    // Reading answers each probe with a pong, so the session stays alive
    // and keeps probing.
    for _ in 0..3 {
        let msg = client.next().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Ping(_)), "got {:?}", msg);
    }

    client.close(None).await.unwrap();
    session.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pump_missed_pong_times_out_within_one_period() {
    let (mut server, client) = ws_pair().await;
    // Keep the client half open but silent: probes are never acknowledged.
    let _client = client;
    let deliveries = stream::pending::<Result<Vec<u8>, lapin::Error>>();

    let start = tokio::time::Instant::now();
    let err = pump(&mut server, deliveries, Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::KeepaliveTimeout));
    // Deadline lapses at 60s; the second probe tick at 108s notices.
    assert_eq!(start.elapsed(), Duration::from_secs(108));
}

#[tokio::test]
async fn test_pump_delivery_error_surfaces() {
    let (mut server, client) = ws_pair().await;
    let _client = client;
    let deliveries =
        stream::iter(vec![Err::<Vec<u8>, _>(fake_amqp_error("channel died"))]);

    let err = pump(&mut server, deliveries, Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Delivery(_)));
}

#[tokio::test]
async fn test_pump_delivery_stream_end_is_channel_closed() {
    let (mut server, client) = ws_pair().await;
    let _client = client;
    let deliveries = stream::iter(Vec::<Result<Vec<u8>, lapin::Error>>::new());

    let err = pump(&mut server, deliveries, Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::ChannelClosed));
}

// =============================================================================
// Classification helpers
// =============================================================================

#[test]
fn test_broken_pipe_is_clean() {
    let err = WsError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
    assert!(is_clean_disconnect(&err));
}

#[test]
fn test_closed_connection_is_clean() {
    assert!(is_clean_disconnect(&WsError::ConnectionClosed));
    assert!(is_clean_disconnect(&WsError::AlreadyClosed));
}

#[test]
fn test_other_errors_are_not_clean() {
    let err = WsError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
    assert!(!is_clean_disconnect(&err));

    let err = WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake);
    assert!(!is_clean_disconnect(&err));
}

#[test]
fn test_payload_message_keeps_bytes() {
    assert_eq!(
        payload_message(b"plain text".to_vec()),
        Message::Text("plain text".to_string())
    );

    let raw = vec![0xff, 0xfe, 0x00, 0x01];
    assert_eq!(payload_message(raw.clone()), Message::Binary(raw));
}

#[test]
fn test_session_error_display() {
    let err = SessionError::Protocol("bad frame".to_string());
    assert!(err.to_string().contains("protocol error"));

    let err = SessionError::KeepaliveTimeout;
    assert!(err.to_string().contains("liveness probe"));

    let err = SessionError::ChannelClosed;
    assert!(err.to_string().contains("channel closed"));
}
