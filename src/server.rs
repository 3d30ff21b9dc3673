//! The TLS listener and supervisor.
//!
//! One task per accepted connection; a fault in any of them never takes
//! the accept loop down. Connection tasks run under `catch_unwind` so even
//! a panic destroys only its own connection.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::classify::{classify, hint_unknown_ca, hint_version_mismatch, ErrorClass};
use crate::config::Config;
use crate::dial::{socket_hygiene, Dialer};
use crate::http::{self, read_envelope, write_cors_preflight, write_html_response, write_plain_response, RequestKind};
use crate::{forward, tls, tunnel};

/// Informational page served to non-proxy (origin-form) requests.
const STATUS_PAGE: &str = "<!DOCTYPE html>\n\
<html>\n<head><title>fwdgate</title></head>\n\
<body>\n<h1>fwdgate is running</h1>\n\
<p>Configure this host and port as your HTTPS proxy to use it.</p>\n\
</body>\n</html>\n";

/// Connection lifecycle counters. Every accepted connection increments
/// `opened` exactly once and `closed` exactly once, on every path.
#[derive(Debug, Default)]
pub struct ConnStats {
    opened: AtomicU64,
    closed: AtomicU64,
}

impl ConnStats {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }
}

pub struct Proxy {
    cfg: Arc<Config>,
    acceptor: TlsAcceptor,
    dialer: Arc<Dialer>,
    listener: TcpListener,
    stats: Arc<ConnStats>,
    shutdown: Arc<Notify>,
}

impl Proxy {
    /// Load the TLS identity from disk and bind the listener. Failures
    /// here are startup failures and exit the process with status 1.
    pub async fn bind(cfg: Config) -> Result<Self> {
        let identity = tls::load_identity(&cfg.cert_dir)
            .with_context(|| format!("loading TLS material from {}", cfg.cert_dir.display()))?;
        Self::bind_with(cfg, identity).await
    }

    /// Bind with an already-loaded identity.
    pub async fn bind_with(cfg: Config, identity: tls::Identity) -> Result<Self> {
        let server_cfg = tls::build_server_config(identity)?;
        let client_cfg = Arc::new(tls::build_client_config());
        let cfg = Arc::new(cfg);
        let dialer = Arc::new(Dialer::new(cfg.upstream.clone(), cfg.dial_timeout, client_cfg));

        let listener = TcpListener::bind(("0.0.0.0", cfg.port))
            .await
            .with_context(|| format!("failed to bind 0.0.0.0:{}", cfg.port))?;
        info!("listening on {}", listener.local_addr()?);

        Ok(Proxy {
            cfg,
            acceptor: TlsAcceptor::from(Arc::new(server_cfg)),
            dialer,
            listener,
            stats: Arc::new(ConnStats::default()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ConnStats> {
        self.stats.clone()
    }

    /// Handle that makes [`Proxy::run`] return, as SIGINT/SIGTERM do.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Serve until SIGINT/SIGTERM (or the shutdown handle) fires, then
    /// give in-flight connections the grace window to drain.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let stats = self.stats.clone();
        let grace = self.cfg.grace;

        tokio::select! {
            res = self.serve() => res,
            _ = shutdown_signal(shutdown) => {
                info!("shutdown signal received, draining in-flight connections");
                drain(&stats, grace).await;
                Ok(())
            }
        }
    }

    /// The accept loop. Per-connection faults never end it; it only
    /// returns on a fatal listener error.
    pub async fn serve(&self) -> Result<()> {
        loop {
            let (sock, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    if classify(&e) == ErrorClass::Fatal {
                        error!("listener failed: {e}");
                        return Err(e.into());
                    }
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            };

            self.stats.opened.fetch_add(1, Ordering::Relaxed);
            let stats = self.stats.clone();
            let cfg = self.cfg.clone();
            let acceptor = self.acceptor.clone();
            let dialer = self.dialer.clone();

            tokio::spawn(async move {
                let conn = handle_connection(sock, acceptor, dialer, cfg);
                if let Err(payload) = AssertUnwindSafe(conn).catch_unwind().await {
                    error!("connection task for {peer_addr} panicked: {}", panic_message(&payload));
                }
                stats.closed.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

async fn shutdown_signal(notify: Arc<Notify>) {
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term => {}
        _ = notify.notified() => {}
    }
}

async fn drain(stats: &ConnStats, grace: Duration) {
    let deadline = Instant::now() + grace;
    while stats.active() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let left = stats.active();
    if left > 0 {
        warn!("{left} connections still open after the grace window; closing hard");
    }
}

async fn handle_connection(sock: TcpStream, acceptor: TlsAcceptor, dialer: Arc<Dialer>, cfg: Arc<Config>) {
    socket_hygiene(&sock);

    let stream = match timeout(cfg.handshake_timeout, acceptor.accept(sock)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            report_handshake_error(&e);
            return;
        }
        Err(_) => {
            debug!("TLS handshake timed out");
            return;
        }
    };

    dispatch(stream, dialer, cfg).await;
}

fn report_handshake_error(err: &io::Error) {
    match classify(err) {
        ErrorClass::BenignDrop => debug!("client dropped during TLS handshake: {err}"),
        ErrorClass::SslVersionMismatch => {
            debug!("non-TLS or legacy-version bytes on the TLS port: {err}");
            hint_version_mismatch();
        }
        ErrorClass::SslUnknownCa => {
            debug!("client rejected our certificate chain: {err}");
            hint_unknown_ca();
        }
        _ => error!("TLS handshake failed: {err}"),
    }
}

async fn dispatch<S>(mut stream: S, dialer: Arc<Dialer>, cfg: Arc<Config>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let envelope = match timeout(cfg.idle_timeout, read_envelope(&mut stream)).await {
        Ok(Ok(e)) => e,
        Ok(Err(e)) => {
            debug!("request parse failed: {e}");
            write_plain_response(&mut stream, 400, "Bad Request", "malformed proxy request\n").await;
            return;
        }
        Err(_) => {
            debug!("client sent no request within the idle window");
            return;
        }
    };

    match http::dispatch(&envelope) {
        RequestKind::ConnectTunnel => tunnel::handle(stream, envelope, &dialer, &cfg).await,
        RequestKind::Forward => forward::handle(stream, envelope, &dialer, &cfg).await,
        RequestKind::Preflight => write_cors_preflight(&mut stream).await,
        RequestKind::StatusPage => write_html_response(&mut stream, STATUS_PAGE).await,
    }
}
