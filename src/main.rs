//! Binary entry-point for the fwdgate proxy.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use fwdgate::config::{Cli, Config};
use fwdgate::server::Proxy;
use fwdgate::upstream::Upstream;

#[tokio::main]
async fn main() {
    // ── 1. CLI flags + environment ─────────────────────────────────────────────
    let cli = Cli::parse();

    // ── 2. Init structured logging (env -> overrides flag) ─────────────────────
    // e.g. RUST_LOG=debug fwdgate
    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    // Panics escaping a detached connection task land here instead of a
    // bare stderr line; the process stays alive.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("panic: {panic_info}");
        default_hook(panic_info);
    }));

    // ── 3. Resolve the upstream once; the dialer reads it immutably ────────────
    let upstream = Upstream::from_env();
    let cfg = Config::from_cli(&cli, upstream);

    info!("Listen   : 0.0.0.0:{}", cfg.port);
    info!("Upstream : {}", cfg.upstream);
    info!("Certs    : {}", cfg.cert_dir.display());

    // ── 4. Build and run the proxy ─────────────────────────────────────────────
    match Proxy::bind(cfg).await {
        Ok(proxy) => {
            if let Err(e) = proxy.run().await {
                error!("Proxy exited with error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Startup failed: {:?}", e);
            std::process::exit(1);
        }
    }
}
