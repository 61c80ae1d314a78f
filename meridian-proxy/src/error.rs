//! Errors raised while building and running the proxy.

use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::{full, ProxyBody};

/// Everything that can go wrong between accepting a request and relaying a response.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration, registration or selection failure from the core.
    #[error(transparent)]
    Core(#[from] meridian_core::Error),

    /// No configured route accepts the request.
    #[error("no route matches {method} {host}{path}")]
    NoRouteMatch {
        /// Request method.
        method: String,
        /// Request host.
        host: String,
        /// Request path.
        path: String,
    },

    /// A configured backend address cannot be used.
    #[error("invalid backend address {address:?}: {reason}")]
    InvalidBackend {
        /// Address as written in the configuration.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The backend round-trip failed.
    #[error("upstream {backend} failed: {source}")]
    Upstream {
        /// Backend address.
        backend: String,
        /// Transport failure.
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    /// The backend did not answer in time.
    #[error("upstream {backend} did not answer within {timeout:?}")]
    Timeout {
        /// Backend address.
        backend: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// No response head was ready before the client-facing deadline.
    #[error("no response within {timeout:?}")]
    ResponseTimeout {
        /// Deadline that elapsed.
        timeout: Duration,
    },

        /// Socket or file failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or key material could not be loaded.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The log subscriber could not be installed.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// Convenience alias used throughout `meridian-proxy`.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Status code a client sees for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRouteMatch { .. }
            | ProxyError::Core(meridian_core::Error::NoSuchRoute(_)) => StatusCode::NOT_FOUND,
            ProxyError::Core(meridian_core::Error::NoHealthyBackend) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout { .. } | ProxyError::ResponseTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text response carrying [`ProxyError::status`].
    pub fn to_response(&self) -> hyper::Response<ProxyBody> {
        let status = self.status();
        let mut response = hyper::Response::new(full(
            status.canonical_reason().unwrap_or("error").to_ascii_lowercase(),
        ));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
