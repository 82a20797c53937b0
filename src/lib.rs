//! Pushbridge - AMQP-to-WebSocket push bridge
//!
//! Streams messages from a topic exchange to browser-facing WebSocket
//! clients in real time. A client sends one JSON array of topic patterns
//! as its first frame and receives every matching broker message until the
//! socket closes. Delivery is best-effort fan-out: nothing is persisted,
//! redelivered, deduplicated or reordered.

pub mod amqp;
pub mod bridge;
pub mod config;
pub mod server;

pub use amqp::{DialError, Dialer, SharedConnection};
pub use bridge::{read_topics, BridgeSession, SessionError, DEFAULT_KEEPALIVE_WINDOW};
pub use config::Config;
pub use server::{
    load_tls_acceptor, BridgeServer, ConnectionCallback, ConnectionInfo, ErrorCallback,
    IdleWatchdog, OriginPolicy,
};
