//! Topic negotiation
//!
//! The first data frame a client sends is a JSON array of topic patterns,
//! e.g. `["orders.created", "orders.#"]`. Nothing broker-side exists until
//! it has been read successfully.

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use super::SessionError;

/// Read the client's topic list as the first data frame of the session.
///
/// Control frames arriving first are skipped (the transport answers pings
/// itself). A close, a socket error, or an unparseable frame aborts the
/// session before any broker-side resources are created.
pub async fn read_topics<S>(socket: &mut WebSocketStream<S>) -> Result<Vec<String>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(raw))) => return parse_topic_list(raw.as_bytes()),
            Some(Ok(Message::Binary(raw))) => return parse_topic_list(&raw),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                continue
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(SessionError::Protocol(
                    "socket closed before a topic list arrived".to_string(),
                ))
            }
            Some(Err(err)) => {
                return Err(SessionError::Protocol(format!(
                    "socket failed before a topic list arrived: {}",
                    err
                )))
            }
        }
    }
}

fn parse_topic_list(raw: &[u8]) -> Result<Vec<String>, SessionError> {
    serde_json::from_slice(raw)
        .map_err(|e| SessionError::Protocol(format!("invalid topic list: {}", e)))
}
