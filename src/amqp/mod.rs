//! Broker Connection Management
//!
//! Owns the single long-lived AMQP connection shared by every bridging
//! session and hands out per-session channels, redialing the broker once
//! when channel creation finds the connection dead.

mod dialer;

pub use dialer::{Dialer, DIAL_ATTEMPTS};

use std::fmt;
use std::sync::Arc;

use lapin::{Channel, Connection};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Error type for broker dialing and channel provisioning.
#[derive(Debug)]
pub enum DialError {
    /// Dialer configuration is unusable (bad URL, resolver list or CA material)
    Config(String),
    /// Broker host lookup through the custom resolvers failed
    Resolve(String),
    /// The broker connection or channel attempt failed
    Amqp(lapin::Error),
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::Config(msg) => write!(f, "broker config error: {}", msg),
            DialError::Resolve(msg) => write!(f, "broker resolve error: {}", msg),
            DialError::Amqp(e) => write!(f, "broker error: {}", e),
        }
    }
}

impl std::error::Error for DialError {}

impl From<lapin::Error> for DialError {
    fn from(e: lapin::Error) -> Self {
        DialError::Amqp(e)
    }
}

/// The process-wide current broker connection.
///
/// Sessions read it concurrently to open their channels; the rare
/// reconnect path replaces it wholesale. Readers take an `Arc` snapshot of
/// the slot, so a half-constructed connection is never observable; the
/// redial lock serializes writers so concurrent channel failures cannot
/// stampede the broker with dials.
pub struct SharedConnection {
    dialer: Dialer,
    current: RwLock<Arc<Connection>>,
    redial: Mutex<()>,
}

impl SharedConnection {
    /// Dial the broker (with backoff) and wrap the connection for sharing.
    pub async fn connect(dialer: Dialer) -> Result<Self, DialError> {
        let connection = dialer.dial_with_backoff().await?;
        Ok(Self {
            dialer,
            current: RwLock::new(Arc::new(connection)),
            redial: Mutex::new(()),
        })
    }

    /// Snapshot of the current connection.
    pub fn current(&self) -> Arc<Connection> {
        self.current.read().clone()
    }

    /// Open a channel for one session.
    ///
    /// On failure the connection is assumed dead: it is redialed exactly
    /// once (replacing the shared slot) and channel creation is retried.
    /// A second failure propagates the retried error to the caller.
    pub async fn channel(&self) -> Result<Channel, DialError> {
        let connection = self.current();
        match connection.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                debug!("channel creation failed ({}), reconnecting to broker", err);
                let fresh = self.replace().await?;
                fresh.create_channel().await.map_err(DialError::Amqp)
            }
        }
    }

    /// Close the underlying broker connection. Used at process shutdown.
    pub async fn close(&self) -> Result<(), lapin::Error> {
        self.current().close(200, "shutting down").await
    }

    /// Replace the shared connection with a freshly dialed one.
    ///
    /// If another task already replaced it while we waited for the redial
    /// lock, the fresh connection is reused instead of dialing again.
    async fn replace(&self) -> Result<Arc<Connection>, DialError> {
        let _guard = self.redial.lock().await;

        let existing = self.current();
        if existing.status().connected() {
            debug!("broker connection already re-established, reusing it");
            return Ok(existing);
        }

        let fresh = Arc::new(self.dialer.dial_with_backoff().await?);
        *self.current.write() = fresh.clone();
        info!("broker connection re-established");
        Ok(fresh)
    }
}
