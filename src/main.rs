//! Pushbridge - AMQP-to-WebSocket push bridge
//!
//! Usage:
//!   pushbridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>         Configuration file path
//!   -b, --bind <ADDR>           WebSocket bind address (default: 0.0.0.0:9090)
//!   -u, --amqp-url <URL>        Full AMQP URL
//!   -x, --amqp-exchange <NAME>  Topic exchange name
//!   --amqp-ca-root <FILE>       AMQP CA root certificate (PEM), if applicable
//!   --custom-dns-resolvers <L>  Custom DNS resolvers, if applicable
//!   -r, --allow-origin-regexp   Regexp validating the Origin header
//!   -d, --development           Run without CORS and TLS
//!   -l, --log-level             Log level (error, warn, info, debug, trace)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use pushbridge::amqp::{Dialer, SharedConnection};
use pushbridge::config::Config;
use pushbridge::server::{load_tls_acceptor, BridgeServer, IdleWatchdog, OriginPolicy};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Pushbridge - AMQP-to-WebSocket push bridge
#[derive(Parser, Debug)]
#[command(name = "pushbridge")]
#[command(author = "Pushbridge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Streams AMQP topic exchange messages to WebSocket clients")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Full AMQP URL
    #[arg(short = 'u', long)]
    amqp_url: Option<String>,

    /// Topic exchange name
    #[arg(short = 'x', long)]
    amqp_exchange: Option<String>,

    /// Path to the AMQP CA root certificate (PEM), if applicable
    #[arg(long)]
    amqp_ca_root: Option<PathBuf>,

    /// Custom DNS resolvers, if applicable
    #[arg(long)]
    custom_dns_resolvers: Option<String>,

    /// Regexp used to validate the Origin header of upgrade requests
    #[arg(short = 'r', long)]
    allow_origin_regexp: Option<String>,

    /// Run in development mode, without CORS and TLS
    #[arg(short, long)]
    development: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise env vars and defaults
    let file_config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error reading configuration from environment: {}", e);
                std::process::exit(1);
            }
        },
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    let bind = args.bind.unwrap_or(file_config.server.bind);
    let amqp_url = args.amqp_url.clone().unwrap_or_else(|| file_config.amqp.url.clone());
    let exchange = args
        .amqp_exchange
        .clone()
        .unwrap_or_else(|| file_config.amqp.exchange.clone());
    if exchange.trim().is_empty() {
        eprintln!("A topic exchange name is required (--amqp-exchange or [amqp].exchange)");
        std::process::exit(1);
    }

    let ca_root = match &args.amqp_ca_root {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(pem) => Some(pem),
            Err(e) => {
                eprintln!("Error reading CA root {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => file_config.amqp.ca_cert.clone(),
    };
    let dns_resolvers = args
        .custom_dns_resolvers
        .clone()
        .or_else(|| file_config.amqp.dns_resolvers.clone());

    let development = args.development || file_config.server.development;
    let origin_pattern = if development {
        String::new()
    } else {
        args.allow_origin_regexp
            .clone()
            .unwrap_or_else(|| file_config.server.allow_origin_regexp.clone())
    };
    let origin = match OriginPolicy::new(&origin_pattern) {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("Invalid origin regexp: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting pushbridge");
    info!("  Bind address: {}", bind);
    info!("  Exchange: {}", exchange);
    info!("  Keepalive window: {:?}", file_config.session.keepalive_window);
    if development {
        info!("  Development mode: TLS and origin checks disabled");
    }

    // Dial the broker (with backoff) before accepting any client.
    let dialer = Dialer::new(amqp_url, ca_root, dns_resolvers);
    let connection = match SharedConnection::connect(dialer).await {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            eprintln!("Cannot establish broker connection: {}", e);
            std::process::exit(1);
        }
    };
    info!("  Broker connection established");

    let mut server = BridgeServer::new(connection, exchange);
    server.set_keepalive_window(file_config.session.keepalive_window);
    server.set_origin_policy(origin);

    if !development {
        if let Some(tls) = &file_config.server.tls {
            match load_tls_acceptor(&tls.cert, &tls.key) {
                Ok(acceptor) => server.set_tls(acceptor),
                Err(e) => {
                    eprintln!("Error loading TLS material: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    server.set_error_callback(Arc::new(|err| warn!("session error: {}", err)));

    let idle_kill = file_config.session.idle_kill;
    let watchdog = (!idle_kill.is_zero()).then(|| IdleWatchdog::new(idle_kill));
    match &watchdog {
        Some(watchdog) => {
            info!("  Idle watchdog: {:?}", idle_kill);
            let counter = watchdog.counter();
            server.set_connection_callback(Arc::new(move |conn| {
                counter.mark();
                info!("Connecting {}", conn.peer);
            }));
        }
        None => {
            server.set_connection_callback(Arc::new(|conn| info!("Connecting {}", conn.peer)));
        }
    }

    let server = Arc::new(server);
    let result = match watchdog {
        Some(watchdog) => {
            tokio::select! {
                result = server.clone().run(bind) => result,
                _ = watchdog.idle() => {
                    warn!("Idle watchdog fired, shutting down");
                    Ok(())
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    Ok(())
                }
            }
        }
        None => {
            tokio::select! {
                result = server.clone().run(bind) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    Ok(())
                }
            }
        }
    };

    server.close().await;
    result.map_err(Into::into)
}
