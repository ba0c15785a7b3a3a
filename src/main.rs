//! Application entry point: CLI parsing, telemetry, dependency wiring, and
//! lifecycle management for the proxy engine.

mod control;
mod home;
mod logging;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ferry::config::{Document, SharedSnapshot, Snapshot, SystemProxyMode};
use ferry::geoip::GeoIp;
use ferry::proxy::{self, ProxyContext};
use ferry::records::{DumpWriter, RecordSink};
use ferry::resolver::{CachingResolver, HickoryResolver, Resolver};
use ferry::servers::HealthRegistry;
use ferry::tls::CertIssuer;

use crate::home::HomePaths;

#[derive(Parser)]
#[command(name = "shuttle", version, about = "A local multi-protocol forwarding proxy")]
struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long = "config", default_value = "shuttle.yaml")]
    config: PathBuf,

    /// Where log output goes.
    #[arg(short = 'l', long = "log-mode", value_enum, default_value = "file")]
    log_mode: logging::LogMode,

    /// Log directory, joined under the shuttle home dir unless absolute.
    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let document =
        Document::load_file(&cli.config).context("configuration load failed")?;
    let paths = HomePaths::resolve(&cli.log_dir)?;
    let _log_guard = logging::init(cli.log_mode, &paths.log_dir, &document.general.log_level)?;

    info!(config = %cli.config.display(), home = %paths.home.display(), "shuttle starting");

    let ctx = build_context(&document, &paths).context("initialization failed")?;

    let cancel = CancellationToken::new();
    spawn_listeners(&document, ctx.clone(), &cancel)?;
    tokio::spawn(proxy::run_prober(ctx.clone(), cancel.child_token()));

    match document.general.set_as_system_proxy {
        SystemProxyMode::Auto => {
            // The platform helper binaries own the actual OS switch.
            info!(
                http_port = document.general.http_port,
                socks_port = document.general.socks_port,
                "system proxy mode is auto; delegating to the platform helper"
            );
        }
        SystemProxyMode::Manual | SystemProxyMode::Off => {}
    }

    let listeners = ListenerBinds {
        socks: (
            document.general.socks_interface.clone(),
            document.general.socks_port,
        ),
        http: (
            document.general.http_interface.clone(),
            document.general.http_port,
        ),
    };

    let (_control_handle, channels) = control::channels();
    run_lifecycle(cli.config.clone(), ctx, channels, listeners).await;

    cancel.cancel();
    // Give in-flight connection tasks a beat to observe cancellation.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("shuttle stopped, see you later");
    Ok(())
}

fn build_context(document: &Document, paths: &HomePaths) -> anyhow::Result<Arc<ProxyContext>> {
    let geoip_path = paths.resolve_file(&document.general.geoip_file);
    let geoip = Arc::new(GeoIp::open(&geoip_path)?);

    let issuer = match &document.mitm {
        None => None,
        Some(mitm) => {
            let cert_pem = std::fs::read_to_string(paths.resolve_file(&mitm.ca_cert_file))
                .context("cannot read MITM CA certificate")?;
            let key_pem = std::fs::read_to_string(paths.resolve_file(&mitm.ca_key_file))
                .context("cannot read MITM CA key")?;
            Some(Arc::new(CertIssuer::from_ca_pem(&cert_pem, &key_pem)?))
        }
    };

    let resolver = build_resolver(document)?;

    let health = Arc::new(HealthRegistry::default());
    let snapshot = Snapshot::build(document, health)?;

    let dump = document
        .general
        .allow_dump
        .then(|| DumpWriter::new(&paths.dump_dir));

    Ok(Arc::new(ProxyContext {
        snapshot: SharedSnapshot::new(snapshot),
        resolver: Arc::new(resolver),
        geoip: Some(geoip),
        records: RecordSink::start(),
        issuer,
        resp_files_dir: paths.resp_files.clone(),
        dump,
        idle_timeout: Duration::from_secs(document.general.idle_timeout_secs),
    }))
}

fn build_resolver(document: &Document) -> anyhow::Result<CachingResolver> {
    let dns = document.dns.clone().unwrap_or_default();

    let upstream: Arc<dyn Resolver> = if dns.servers.is_empty() {
        Arc::new(HickoryResolver::from_system().context("system resolver unavailable")?)
    } else {
        let servers: Vec<SocketAddr> = dns
            .servers
            .iter()
            .map(|s| parse_dns_server(s))
            .collect::<anyhow::Result<_>>()?;
        Arc::new(HickoryResolver::from_servers(&servers))
    };

    Ok(CachingResolver::new(
        upstream,
        dns.hosts,
        dns.ttl.map(Duration::from_secs),
    ))
}

fn parse_dns_server(s: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = s
        .parse()
        .with_context(|| format!("bad DNS server address: {s}"))?;
    Ok(SocketAddr::new(ip, 53))
}

fn spawn_listeners(
    document: &Document,
    ctx: Arc<ProxyContext>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let general = &document.general;

    let socks_addr = listen_addr(&general.socks_interface, general.socks_port)?;
    let socks_ctx = ctx.clone();
    let socks_cancel = cancel.child_token();
    tokio::spawn(async move {
        if let Err(e) = proxy::run_socks_listener(socks_addr, socks_ctx, socks_cancel).await {
            error!(addr = %socks_addr, error = %e, "SOCKS listener failed");
        }
    });

    let http_addr = listen_addr(&general.http_interface, general.http_port)?;
    let http_cancel = cancel.child_token();
    tokio::spawn(async move {
        if let Err(e) = proxy::run_http_listener(http_addr, ctx, http_cancel).await {
            error!(addr = %http_addr, error = %e, "HTTP listener failed");
        }
    });

    Ok(())
}

fn listen_addr(interface: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = interface
        .parse()
        .with_context(|| format!("bad listen interface: {interface}"))?;
    Ok(SocketAddr::new(ip, port))
}

struct ListenerBinds {
    socks: (String, u16),
    http: (String, u16),
}

/// Block until something asks the process to stop. Reload swaps the
/// snapshot in place; listeners stay bound for the process lifetime.
async fn run_lifecycle(
    config_path: PathBuf,
    ctx: Arc<ProxyContext>,
    mut channels: control::ControlChannels,
    listeners: ListenerBinds,
) {
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "signal handler failed");
                }
                info!("interrupt received, shutting down");
                return;
            }
            Some(()) = channels.shutdown.recv() => {
                info!("shutdown requested");
                return;
            }
            Some(artifact) = channels.upgrade.recv() => {
                // The upgrade helper takes over from here.
                info!(artifact, "shutting down for upgrade");
                return;
            }
            Some(()) = channels.reload.recv() => {
                reload(&config_path, &ctx, &listeners);
            }
        }
    }
}

fn reload(config_path: &PathBuf, ctx: &Arc<ProxyContext>, listeners: &ListenerBinds) {
    let document = match Document::load_file(config_path) {
        Ok(document) => document,
        Err(e) => {
            error!(error = %e, "reload failed: configuration did not parse");
            return;
        }
    };

    // Listener binds are fixed per process run.
    let general = &document.general;
    if (general.socks_interface.as_str(), general.socks_port)
        != (listeners.socks.0.as_str(), listeners.socks.1)
        || (general.http_interface.as_str(), general.http_port)
            != (listeners.http.0.as_str(), listeners.http.1)
    {
        warn!("listener addresses changed in the reloaded file; they apply after a restart only");
    }

    let current = ctx.snapshot.load();
    let health = current.pool.health().clone();
    match Snapshot::build(&document, health) {
        Ok(snapshot) => {
            ctx.snapshot.store(snapshot);
            info!("configuration reloaded; new connections use the new tables");
        }
        Err(e) => {
            error!(error = %e, "reload failed: keeping the current snapshot");
        }
    }
}
