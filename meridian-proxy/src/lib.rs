//! Meridian Proxy Engine
//!
//! The Tokio engine behind the `meridian` binary: backend forwarding and
//! probing, per-route backend pools, the request dispatcher, and the
//! listener loop.

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;

pub mod dispatcher;
pub mod error;
pub mod headers;
pub mod logging;
pub mod pool;
pub mod server;
pub mod sticky;
pub mod tls;
pub mod upstream;

/// Active health probing.
pub mod health_check {
    pub mod prober;
}

pub use dispatcher::Dispatcher;
pub use error::{ProxyError, Result};
pub use pool::BackendPool;

/// Body type used for both directions of a proxied exchange.
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// A complete in-memory body.
pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// A zero-length body.
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
