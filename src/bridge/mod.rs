//! WebSocket Bridging Sessions
//!
//! One session per accepted client: negotiate the topic list, provision
//! broker-side routing, then pump deliveries and keepalive probes until
//! either side goes away.

mod negotiate;
mod session;

#[cfg(test)]
mod tests;

pub use negotiate::read_topics;
pub use session::{BridgeSession, DEFAULT_KEEPALIVE_WINDOW};

use std::fmt;

use tokio_tungstenite::tungstenite::Error as WsError;

use crate::amqp::DialError;

/// Error type for a bridging session.
///
/// Every variant ends the session; none of them are retried. Broken pipes
/// and peer-initiated closes never surface here, they end the session
/// cleanly instead.
#[derive(Debug)]
pub enum SessionError {
    /// The first frame was missing or not a JSON list of topic strings
    Protocol(String),
    /// No broker channel could be obtained for this session
    Channel(DialError),
    /// Exchange/queue/binding/consumer setup failed
    Provision(lapin::Error),
    /// Socket I/O failed while streaming
    Socket(WsError),
    /// The broker delivery stream failed while streaming
    Delivery(lapin::Error),
    /// The broker channel closed while the session was streaming
    ChannelClosed,
    /// The peer did not answer a liveness probe within the window
    KeepaliveTimeout,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            SessionError::Channel(e) => write!(f, "channel provisioning failed: {}", e),
            SessionError::Provision(e) => write!(f, "subscription setup failed: {}", e),
            SessionError::Socket(e) => write!(f, "socket error: {}", e),
            SessionError::Delivery(e) => write!(f, "delivery stream error: {}", e),
            SessionError::ChannelClosed => write!(f, "broker channel closed while streaming"),
            SessionError::KeepaliveTimeout => {
                write!(f, "peer did not answer liveness probe in time")
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Whether a socket error means the peer is simply gone.
///
/// Writing to an already-disconnected peer is a normal session end, not a
/// fault to report.
pub(crate) fn is_clean_disconnect(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Io(io_err) => io_err.kind() == std::io::ErrorKind::BrokenPipe,
        _ => false,
    }
}
