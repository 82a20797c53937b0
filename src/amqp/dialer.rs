//! Broker dialing
//!
//! Builds AMQP connections from a URL plus optional trust material and
//! custom DNS nameservers, with a bounded linear-backoff retry variant
//! for startup and reconnects.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use lapin::tcp::OwnedTLSConfig;
use lapin::uri::AMQPUri;
use lapin::{Connection, ConnectionProperties};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tracing::{debug, warn};

use super::DialError;

/// Maximum connection attempts for the backoff variant.
pub const DIAL_ATTEMPTS: u64 = 5;

/// AMQP heartbeat negotiated on every broker connection, in seconds.
const HEARTBEAT_SECS: u16 = 10;

/// Default port for plain-UDP DNS nameservers.
const DNS_PORT: u16 = 53;

/// Factory for broker connections.
///
/// Holds the broker URL together with the optional CA root PEM and the
/// optional custom nameserver list. `dial` attempts a single connection;
/// `dial_with_backoff` retries up to [`DIAL_ATTEMPTS`] times with linearly
/// increasing sleeps (3s, 6s, 9s, 12s) between attempts.
#[derive(Debug, Clone)]
pub struct Dialer {
    url: String,
    ca_root_pem: Option<String>,
    dns_resolvers: Option<String>,
}

impl Dialer {
    /// Create a dialer for the given broker URL.
    ///
    /// `ca_root_pem` is the PEM text of the certificate(s) the TLS link
    /// should trust; `dns_resolvers` is a comma- or whitespace-separated
    /// list of `ip[:port]` nameserver entries. Empty strings are treated
    /// the same as absent values.
    pub fn new(
        url: impl Into<String>,
        ca_root_pem: Option<String>,
        dns_resolvers: Option<String>,
    ) -> Self {
        Self {
            url: url.into(),
            ca_root_pem: ca_root_pem.filter(|s| !s.trim().is_empty()),
            dns_resolvers: dns_resolvers.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Attempt a single broker connection.
    pub async fn dial(&self) -> Result<Connection, DialError> {
        self.plan()?.connect().await
    }

    /// Attempt a broker connection with bounded linear backoff.
    ///
    /// Configuration problems (bad URL, bad resolver list, bad CA PEM) fail
    /// immediately; only the network attempt itself is retried.
    pub async fn dial_with_backoff(&self) -> Result<Connection, DialError> {
        let plan = self.plan()?;
        retry_with_backoff(|| {
            let plan = plan.clone();
            async move { plan.connect().await }
        })
        .await
    }

    /// Validate the dialer configuration into a connect plan.
    fn plan(&self) -> Result<DialPlan, DialError> {
        let mut uri: AMQPUri = self
            .url
            .parse()
            .map_err(|e: String| DialError::Config(format!("invalid broker URL: {}", e)))?;
        uri.query.heartbeat = Some(HEARTBEAT_SECS);

        let resolvers = match &self.dns_resolvers {
            Some(list) => Some(parse_resolvers(list)?),
            None => None,
        };

        if let Some(pem) = &self.ca_root_pem {
            validate_ca_root(pem)?;
        }

        Ok(DialPlan {
            uri,
            resolvers,
            ca_root_pem: self.ca_root_pem.clone(),
        })
    }
}

/// A validated dial: URL parsed, resolver list parsed, CA material checked.
#[derive(Clone)]
struct DialPlan {
    uri: AMQPUri,
    resolvers: Option<Vec<SocketAddr>>,
    ca_root_pem: Option<String>,
}

impl DialPlan {
    async fn connect(self) -> Result<Connection, DialError> {
        let mut uri = self.uri;
        if let Some(resolvers) = &self.resolvers {
            let ip = resolve_host(resolvers, &uri.authority.host).await?;
            debug!("resolved broker host {} to {}", uri.authority.host, ip);
            uri.authority.host = ip.to_string();
        }

        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        match self.ca_root_pem {
            Some(pem) => {
                let tls = OwnedTLSConfig {
                    identity: None,
                    cert_chain: Some(pem),
                };
                Connection::connect_uri_with_config(uri, options, tls).await
            }
            None => Connection::connect_uri(uri, options).await,
        }
        .map_err(DialError::Amqp)
    }
}

/// Retry an operation up to [`DIAL_ATTEMPTS`] times, sleeping
/// `3 * attempt` seconds after each failure, returning the first success
/// or the final attempt's error.
pub(crate) async fn retry_with_backoff<T, F, Fut>(mut attempt_fn: F) -> Result<T, DialError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DialError>>,
{
    let mut attempt = 1;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt == DIAL_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!("broker connection failed, attempt {}: {}", attempt, err);
                tokio::time::sleep(Duration::from_secs(3 * attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// Parse a comma- or whitespace-separated nameserver list.
///
/// Entries are `ip` or `ip:port` (port 53 assumed). Unparseable entries are
/// skipped with a warning; an input that yields no usable entries is a
/// configuration error.
pub(crate) fn parse_resolvers(list: &str) -> Result<Vec<SocketAddr>, DialError> {
    let mut resolvers = Vec::new();
    for entry in list
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        if let Ok(addr) = entry.parse::<SocketAddr>() {
            resolvers.push(addr);
        } else if let Ok(ip) = entry.parse::<IpAddr>() {
            resolvers.push(SocketAddr::new(ip, DNS_PORT));
        } else {
            warn!("skipping unparseable DNS resolver entry '{}'", entry);
        }
    }
    if resolvers.is_empty() {
        return Err(DialError::Config("no valid DNS resolvers".to_string()));
    }
    Ok(resolvers)
}

/// Check that the CA root PEM holds at least one parseable certificate.
pub(crate) fn validate_ca_root(pem: &str) -> Result<(), DialError> {
    let mut certs = 0;
    for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
        cert.map_err(|e| DialError::Config(format!("invalid CA root certificate: {}", e)))?;
        certs += 1;
    }
    if certs == 0 {
        return Err(DialError::Config(
            "CA root contains no certificates".to_string(),
        ));
    }
    Ok(())
}

/// Resolve the broker host against the configured nameservers only.
async fn resolve_host(resolvers: &[SocketAddr], host: &str) -> Result<IpAddr, DialError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let group = NameServerConfigGroup::from(
        resolvers
            .iter()
            .map(|addr| NameServerConfig::new(*addr, Protocol::Udp))
            .collect::<Vec<_>>(),
    );
    let config = ResolverConfig::from_parts(None, Vec::new(), group);
    let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| DialError::Resolve(format!("lookup for {} failed: {}", host, e)))?;
    lookup
        .iter()
        .next()
        .ok_or_else(|| DialError::Resolve(format!("no addresses found for {}", host)))
}
