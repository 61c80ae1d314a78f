//! Server module for accepting connections and driving the dispatcher.

use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use meridian_admin::StatusSource;
use meridian_core::config::{parse_listen_addr, Config};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::logging::TracingAccessLog;
use crate::tls;

/// Client-facing connection settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Deadline for receiving a complete request head.
    pub read_timeout: Duration,
}

/// Accepts connections on `listener` until `shutdown` resolves.
///
/// Each connection is served on its own task; a failing connection never
/// affects the accept loop.
pub async fn serve<F>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    tls_acceptor: Option<TlsAcceptor>,
    settings: ServerSettings,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    info!(addr = %listener.local_addr()?, tls = tls_acceptor.is_some(), "listening");
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    accept_failed(&err).await;
                    continue;
                }
            },
        };

        let dispatcher = Arc::clone(&dispatcher);
        match &tls_acceptor {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_connection(tls_stream, peer, dispatcher, settings).await,
                        Err(err) => debug!(%peer, error = %err, "TLS handshake failed"),
                    }
                });
            }
            None => {
                tokio::spawn(serve_connection(stream, peer, dispatcher, settings));
            }
        }
    }
}

/// Pause after a failed `accept` (e.g. `EMFILE`) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn accept_failed(err: &std::io::Error) {
    warn!(error = %err, backoff = ?ACCEPT_BACKOFF, "accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn serve_connection<I>(io: I, peer: SocketAddr, dispatcher: Arc<Dispatcher>, settings: ServerSettings)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let req = req.map(|body| body.boxed());
            Ok::<_, Infallible>(dispatcher.dispatch(req, Some(peer)).await)
        }
    });

    if let Err(err) = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.read_timeout)
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!(%peer, error = %err, "connection closed with error");
    }
}

/// Builds every route, binds the listeners and serves until `shutdown` resolves.
///
/// Startup errors are returned before any listener opens.
pub async fn run<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr = parse_listen_addr(&config.service.listen)?;
    let settings = ServerSettings {
        read_timeout: config.defaults.read_timeout()?,
    };

    let tls_acceptor = match config.tls.as_ref().filter(|tls| tls.enabled) {
        Some(tls_config) => Some(TlsAcceptor::from(tls::load_tls_config(
            &tls_config.cert_path,
            &tls_config.key_path,
        )?)),
        None => None,
    };

    let dispatcher = Arc::new(Dispatcher::from_config(&config, Arc::new(TracingAccessLog))?);

    let admin = if config.admin.enabled {
        let admin_addr = parse_listen_addr(&config.admin.listen)?;
        let listener = TcpListener::bind(admin_addr).await?;
        let source: Arc<dyn StatusSource> = dispatcher.clone();
        let admin_config = config.admin.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = meridian_admin::serve(listener, &admin_config, source).await {
                error!(error = %err, "admin endpoint stopped");
            }
        }))
    } else {
        None
    };

    let listener = TcpListener::bind(addr).await?;
    info!(
        service = %config.service.name,
        env = %config.service.env,
        routes = dispatcher.router().len(),
        "meridian started"
    );

    let served = serve(listener, Arc::clone(&dispatcher), tls_acceptor, settings, shutdown).await;

    dispatcher.shutdown();
    if let Some(admin) = admin {
        admin.abort();
    }
    served
}
