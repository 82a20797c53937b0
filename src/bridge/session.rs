//! Bridging session state machine
//!
//! A session owns one broker channel and one client socket and moves
//! through `Negotiating → Provisioning → Streaming → Closing → Closed`.
//! Each state has one transition method; the session object is discarded
//! once `Closed` is reached.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer, ExchangeKind};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::{is_clean_disconnect, negotiate, SessionError};

/// Time allowed for the peer to answer a liveness probe.
pub const DEFAULT_KEEPALIVE_WINDOW: Duration = Duration::from_secs(60);

/// Probes are sent every 9/10 of the keepalive window.
fn ping_period(window: Duration) -> Duration {
    window * 9 / 10
}

/// One client's bridging session.
pub struct BridgeSession<S> {
    channel: Channel,
    socket: WebSocketStream<S>,
    exchange: String,
    keepalive_window: Duration,
    peer: SocketAddr,
}

/// Session lifecycle. Later states carry the resources the earlier ones
/// produced, so a session cannot stream before it has provisioned.
enum State {
    Negotiating,
    Provisioning { topics: Vec<String> },
    Streaming { consumer: Consumer },
    Closing { outcome: Result<(), SessionError> },
    Closed { outcome: Result<(), SessionError> },
}

impl<S> BridgeSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        channel: Channel,
        socket: WebSocketStream<S>,
        exchange: impl Into<String>,
        keepalive_window: Duration,
        peer: SocketAddr,
    ) -> Self {
        Self {
            channel,
            socket,
            exchange: exchange.into(),
            keepalive_window,
            peer,
        }
    }

    /// Drive the session to completion.
    ///
    /// Returns `Ok(())` for clean ends (peer close, broken pipe) and the
    /// terminal error otherwise. The channel and socket are released on
    /// every exit path.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut state = State::Negotiating;
        loop {
            state = match state {
                State::Negotiating => self.negotiate().await,
                State::Provisioning { topics } => self.provision(topics).await,
                State::Streaming { consumer } => self.stream(consumer).await,
                State::Closing { outcome } => self.close(outcome).await,
                State::Closed { outcome } => return outcome,
            };
        }
    }

    /// Negotiating: read the topic list off the socket.
    ///
    /// No queue or consumer exists yet, so a failure here releases only
    /// the channel.
    async fn negotiate(&mut self) -> State {
        match negotiate::read_topics(&mut self.socket).await {
            Ok(topics) => {
                debug!("session {}: requested topics {:?}", self.peer, topics);
                State::Provisioning { topics }
            }
            Err(err) => State::Closing { outcome: Err(err) },
        }
    }

    /// Provisioning: declare the exchange and queue, bind every topic,
    /// start the consumer.
    async fn provision(&mut self, topics: Vec<String>) -> State {
        match self.subscribe(&topics).await {
            Ok(consumer) => State::Streaming { consumer },
            Err(err) => State::Closing {
                outcome: Err(SessionError::Provision(err)),
            },
        }
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Consumer, lapin::Error> {
        let queue = setup_topology(&self.channel, &self.exchange, topics).await?;
        debug!(
            "session {}: queue '{}' bound to {} topics on exchange '{}'",
            self.peer,
            queue,
            topics.len(),
            self.exchange
        );
        // Auto-ack: the bridge never redelivers, messages are considered
        // delivered the moment the broker hands them off.
        self.channel
            .basic_consume(
                &queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
    }

    /// Streaming: pump deliveries and keepalive probes until either side
    /// goes away.
    async fn stream(&mut self, consumer: Consumer) -> State {
        let deliveries = consumer.map(|result| result.map(|delivery| delivery.data));
        let outcome = pump(&mut self.socket, deliveries, self.keepalive_window).await;
        State::Closing { outcome }
    }

    /// Closing: best-effort teardown. All steps are attempted even if one
    /// fails; the keepalive ticker was already dropped with the streaming
    /// state.
    async fn close(&mut self, outcome: Result<(), SessionError>) -> State {
        if let Err(err) = self.channel.close(200, "session ended").await {
            debug!("session {}: channel close failed: {}", self.peer, err);
        }
        if let Err(err) = self.socket.close(None).await {
            debug!("session {}: socket close failed: {}", self.peer, err);
        }
        State::Closed { outcome }
    }
}

/// Broker-side routing setup used by a session.
///
/// Split out as a trait so the declare/bind ordering is testable without a
/// live broker.
#[async_trait]
pub(crate) trait BrokerTopology {
    /// Declare the durable topic exchange. Idempotent on the broker side.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), lapin::Error>;
    /// Declare the session's exclusive, broker-named queue.
    async fn declare_queue(&self) -> Result<String, lapin::Error>;
    /// Bind the queue to the exchange under one topic pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, topic: &str)
        -> Result<(), lapin::Error>;
}

#[async_trait]
impl BrokerTopology for Channel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), lapin::Error> {
        self.exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
    }

    async fn declare_queue(&self) -> Result<String, lapin::Error> {
        let queue = self
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        topic: &str,
    ) -> Result<(), lapin::Error> {
        self.queue_bind(
            queue,
            exchange,
            topic,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
    }
}

/// Declare the exchange, declare the queue, then add one binding per topic.
///
/// An empty topic list is legal: the queue exists but receives nothing and
/// the session idles on keepalives.
pub(crate) async fn setup_topology<T>(
    topology: &T,
    exchange: &str,
    topics: &[String],
) -> Result<String, lapin::Error>
where
    T: BrokerTopology,
{
    topology.declare_exchange(exchange).await?;
    let queue = topology.declare_queue().await?;
    for topic in topics {
        topology.bind_queue(&queue, exchange, topic).await?;
    }
    Ok(queue)
}

/// One wakeup of the streaming loop.
enum Event {
    Delivery(Option<Result<Vec<u8>, lapin::Error>>),
    Tick,
    Inbound(Option<Result<Message, WsError>>),
}

/// The streaming loop: forward every delivery in receipt order, probe the
/// peer every ping period, and give up when a probe goes unanswered for a
/// full keepalive window.
pub(crate) async fn pump<S, D>(
    socket: &mut WebSocketStream<S>,
    mut deliveries: D,
    keepalive_window: Duration,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Stream<Item = Result<Vec<u8>, lapin::Error>> + Unpin,
{
    let period = ping_period(keepalive_window);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_ack = Instant::now();

    loop {
        let event = tokio::select! {
            delivery = deliveries.next() => Event::Delivery(delivery),
            _ = ticker.tick() => Event::Tick,
            incoming = socket.next() => Event::Inbound(incoming),
        };

        match event {
            Event::Delivery(Some(Ok(payload))) => {
                match socket.send(payload_message(payload)).await {
                    Ok(()) => {}
                    Err(err) if is_clean_disconnect(&err) => return Ok(()),
                    Err(err) => return Err(SessionError::Socket(err)),
                }
            }
            Event::Delivery(Some(Err(err))) => return Err(SessionError::Delivery(err)),
            Event::Delivery(None) => return Err(SessionError::ChannelClosed),
            Event::Tick => {
                if last_ack.elapsed() >= keepalive_window {
                    return Err(SessionError::KeepaliveTimeout);
                }
                match socket.send(Message::Ping(Vec::new())).await {
                    Ok(()) => {}
                    Err(err) if is_clean_disconnect(&err) => return Ok(()),
                    Err(err) => return Err(SessionError::Socket(err)),
                }
            }
            Event::Inbound(Some(Ok(Message::Pong(_)))) => last_ack = Instant::now(),
            Event::Inbound(Some(Ok(Message::Close(_)))) | Event::Inbound(None) => return Ok(()),
            // Anything else a client sends after negotiation is ignored.
            Event::Inbound(Some(Ok(_))) => {}
            Event::Inbound(Some(Err(err))) if is_clean_disconnect(&err) => return Ok(()),
            Event::Inbound(Some(Err(err))) => return Err(SessionError::Socket(err)),
        }
    }
}

/// Wrap a delivery payload as one outbound frame, byte-for-byte.
///
/// Text frames must be valid UTF-8, so anything else goes out as Binary.
pub(crate) fn payload_message(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text),
        Err(raw) => Message::Binary(raw.into_bytes()),
    }
}
