//! Shared per-process proxy state and the listener accept loops.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{SharedSnapshot, Snapshot};
use crate::error::Result;
use crate::geoip::GeoIp;
use crate::network::async_stream::AsyncStream;
use crate::network::socket::new_tcp_listener;
use crate::records::{DumpWriter, RecordSink};
use crate::request::Request;
use crate::resolver::CachingResolver;
use crate::servers::{self, Server};
use crate::tls::CertIssuer;
use crate::{http, socks};

/// Everything a connection task needs, shared by both front-ends.
pub struct ProxyContext {
    pub snapshot: SharedSnapshot,
    pub resolver: Arc<CachingResolver>,
    pub geoip: Option<Arc<GeoIp>>,
    pub records: RecordSink,
    pub issuer: Option<Arc<CertIssuer>>,
    /// Directory holding mock response bodies.
    pub resp_files_dir: PathBuf,
    pub dump: Option<DumpWriter>,
    pub idle_timeout: Duration,
}

impl ProxyContext {
    pub fn mitm_enabled(&self) -> bool {
        self.issuer.is_some()
    }

    /// Classify a request under the given snapshot and resolve its target
    /// server. Returns the server plus the matched rule's display form.
    pub async fn route(
        &self,
        snapshot: &Snapshot,
        request: &mut Request,
    ) -> Result<(Arc<Server>, String)> {
        let rule = snapshot
            .rules
            .classify(request, &self.resolver, self.geoip.as_ref())
            .await?;
        let server = snapshot.pool.get(&rule.target)?;
        Ok((server, rule.to_string()))
    }

    /// Route and dial in one step: the common path for tunneled traffic.
    pub async fn establish(
        &self,
        snapshot: &Snapshot,
        request: &mut Request,
    ) -> Result<(Box<dyn AsyncStream>, Arc<Server>, String)> {
        let (server, rule) = self.route(snapshot, request).await?;
        debug!(
            protocol = %request.protocol,
            target = %request.target,
            server = %server.name,
            kind = server.kind.name(),
            rule = %rule,
            "dispatch"
        );
        let upstream = servers::dial(&server, &request.location, &self.resolver).await?;
        Ok((upstream, server, rule))
    }
}

/// Periodic health probe over whatever server table is current.
pub async fn run_prober(ctx: Arc<ProxyContext>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(servers::PROBE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let snapshot = ctx.snapshot.load();
        snapshot.pool.probe_once(&ctx.resolver).await;
    }
}

#[derive(Clone, Copy)]
enum FrontEnd {
    Socks,
    Http,
}

pub async fn run_socks_listener(
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    run_listener(addr, ctx, cancel, FrontEnd::Socks).await
}

pub async fn run_http_listener(
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    run_listener(addr, ctx, cancel, FrontEnd::Http).await
}

async fn run_listener(
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    cancel: CancellationToken,
    front_end: FrontEnd,
) -> std::io::Result<()> {
    let listener = new_tcp_listener(addr, 1024)?;
    match front_end {
        FrontEnd::Socks => info!(%addr, "SOCKS listener up"),
        FrontEnd::Http => info!(%addr, "HTTP/HTTPS listener up"),
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!(%addr, "listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // Usually EMFILE pressure; back off instead of spinning.
                    warn!(%addr, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        debug!(%peer, "accepted connection");
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = match front_end {
                FrontEnd::Socks => {
                    AssertUnwindSafe(socks::handle(stream, ctx)).catch_unwind().await
                }
                FrontEnd::Http => {
                    AssertUnwindSafe(handle_http(stream, ctx)).catch_unwind().await
                }
            };
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(%peer, error = %e, "connection finished with error"),
                // The guard that keeps one broken connection from taking the
                // process down: log and move on.
                Err(panic) => {
                    let error = crate::error::Error::InternalPanic(panic_message(&panic));
                    error!(%peer, %error, "connection task panicked");
                }
            }
        });
    }
}

async fn handle_http(stream: TcpStream, ctx: Arc<ProxyContext>) -> Result<()> {
    http::handle_connection(stream, ctx).await
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
