//! Bridge Server
//!
//! Accepts WebSocket clients (optionally through TLS), validates their
//! origin during the upgrade, provisions a broker channel per connection
//! and runs one bridging session per socket to completion.

mod origin;
mod tls;
mod watchdog;

pub use origin::OriginPolicy;
pub use tls::{load_tls_acceptor, TlsError};
pub use watchdog::{ConnectionCounter, IdleWatchdog};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::amqp::SharedConnection;
use crate::bridge::{BridgeSession, SessionError, DEFAULT_KEEPALIVE_WINDOW};

/// Metadata about an accepted connection, handed to the connection callback.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Peer socket address
    pub peer: SocketAddr,
    /// The request's `Origin` header, when present
    pub origin: Option<String>,
}

/// Optional hook invoked with every session-terminating error. Can be used
/// for logging; never influences control flow.
pub type ErrorCallback = Arc<dyn Fn(&SessionError) + Send + Sync>;

/// Optional hook invoked with every accepted connection.
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionInfo) + Send + Sync>;

/// The AMQP-to-WebSocket bridge server.
pub struct BridgeServer {
    connection: Arc<SharedConnection>,
    exchange: String,
    keepalive_window: Duration,
    origin: OriginPolicy,
    tls: Option<TlsAcceptor>,
    on_error: Option<ErrorCallback>,
    on_connection: Option<ConnectionCallback>,
}

impl BridgeServer {
    /// Create a server bridging `exchange` over the given shared broker
    /// connection. Origin checking starts out open and TLS off.
    pub fn new(connection: Arc<SharedConnection>, exchange: impl Into<String>) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
            keepalive_window: DEFAULT_KEEPALIVE_WINDOW,
            origin: OriginPolicy::allow_all(),
            tls: None,
            on_error: None,
            on_connection: None,
        }
    }

    /// Override the keepalive window applied to every session.
    pub fn set_keepalive_window(&mut self, window: Duration) {
        self.keepalive_window = window;
    }

    /// Restrict which origins may connect.
    pub fn set_origin_policy(&mut self, policy: OriginPolicy) {
        self.origin = policy;
    }

    /// Terminate TLS on the listener.
    pub fn set_tls(&mut self, acceptor: TlsAcceptor) {
        self.tls = Some(acceptor);
    }

    /// Hook invoked with every session-terminating error.
    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.on_error = Some(callback);
    }

    /// Hook invoked with every accepted connection.
    pub fn set_connection_callback(&mut self, callback: ConnectionCallback) {
        self.on_connection = Some(callback);
    }

    /// Run the accept loop. One task is spawned per inbound connection;
    /// sessions never block each other.
    pub async fn run(self: Arc<Self>, bind: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(bind).await?;
        info!(
            "WebSocket listener on {}{}",
            bind,
            if self.tls.is_some() { " (TLS)" } else { "" }
        );
        if self.origin.is_open() {
            info!("origin checking is disabled");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("new connection from {}", peer);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Close the shared broker connection. Used at process shutdown.
    pub async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            warn!("broker connection close failed: {}", e);
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        match self.tls.clone() {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => self.serve_socket(stream, peer).await,
                Err(err) => debug!("TLS handshake failed for {}: {}", peer, err),
            },
            None => self.serve_socket(stream, peer).await,
        }
    }

    async fn serve_socket<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let policy = self.origin.clone();
        let mut origin_header: Option<String> = None;
        let callback = |request: &Request, response: Response| {
            let origin = request
                .headers()
                .get("origin")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            if !policy.allows_header(origin.as_deref()) {
                let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                return Err(rejection);
            }
            origin_header = origin;
            Ok(response)
        };

        let socket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(socket) => socket,
            Err(err) => {
                debug!("WebSocket handshake failed for {}: {}", peer, err);
                return;
            }
        };

        // One channel per session; a failure here drops only this client.
        let channel = match self.connection.channel().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!("no broker channel for {}: {}", peer, err);
                self.report(&SessionError::Channel(err));
                return;
            }
        };

        self.notify(&ConnectionInfo {
            peer,
            origin: origin_header,
        });

        let session = BridgeSession::new(
            channel,
            socket,
            self.exchange.clone(),
            self.keepalive_window,
            peer,
        );
        match session.run().await {
            Ok(()) => debug!("session for {} ended cleanly", peer),
            Err(err) => {
                debug!("session for {} failed: {}", peer, err);
                self.report(&err);
            }
        }
    }

    fn report(&self, err: &SessionError) {
        if let Some(callback) = &self.on_error {
            callback(err);
        }
    }

    fn notify(&self, info: &ConnectionInfo) {
        if let Some(callback) = &self.on_connection {
            callback(info);
        }
    }
}
