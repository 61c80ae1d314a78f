//! Operational and access logging.
//!
//! Operational messages go through the `tracing` macros. Access records are
//! emitted on their own target so they can be routed to a separate file.

use hyper::{Method, StatusCode};
use meridian_core::config::LoggingConfig;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::filter::{filter_fn, Directive, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

use crate::error::{ProxyError, Result};

/// `tracing` target carrying one event per handled request.
pub const ACCESS_TARGET: &str = "meridian::access";

/// Outcome of one request, handed to the access log exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    /// Request method.
    pub method: Method,
    /// Request path, without the query string.
    pub path: String,
    /// Status sent to the client.
    pub status: StatusCode,
    /// Time from receipt to response headers.
    pub elapsed: Duration,
    /// Address of the backend that handled the request, if one was chosen.
    pub backend: Option<String>,
    /// Peer address of the client.
    pub client: Option<SocketAddr>,
}

/// Sink for access records.
pub trait AccessLog: Send + Sync {
    /// Record one handled request.
    fn record(&self, record: &AccessRecord);
}

/// Emits access records as `tracing` events on [`ACCESS_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, record: &AccessRecord) {
        info!(
            target: ACCESS_TARGET,
            method = %record.method,
            path = %record.path,
            status = record.status.as_u16(),
            elapsed_us = record.elapsed.as_micros() as u64,
            backend = record.backend.as_deref().unwrap_or("-"),
            client = ?record.client,
            "access"
        );
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `config.level`. Access records are always kept at
/// `info`, and go to `config.access_log` when it names a file.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let access_directive = format!("{ACCESS_TARGET}=info")
        .parse::<Directive>()
        .map_err(|err| ProxyError::Logging(format!("{err}")))?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|err| ProxyError::Logging(format!("invalid log level {:?}: {err}", config.level)))?
        .add_directive(access_directive);

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match access_file(&config.access_log) {
        None => registry.with(fmt::layer().with_target(true)).try_init(),
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_filter(filter_fn(|meta| meta.target() != ACCESS_TARGET)),
                )
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_writer(Mutex::new(file))
                        .with_filter(filter_fn(|meta| meta.target() == ACCESS_TARGET)),
                )
                .try_init()
        }
    };

    installed.map_err(|err| ProxyError::Logging(err.to_string()))
}

fn access_file(destination: &str) -> Option<&str> {
    match destination.trim() {
        "" | "-" => None,
        path => Some(path),
    }
}
