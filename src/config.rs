use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::http::TargetAuthority;
use crate::upstream::Upstream;

#[derive(Parser, Debug)]
#[command(name = "fwdgate", version, about = "Local TLS-terminating forward proxy")]
pub struct Cli {
    /// Listening port for the TLS side.
    #[arg(long, env = "HTTPS_PROXY_PORT", default_value_t = 10443)]
    pub port: u16,

    /// Dial and forward-request timeout in milliseconds.
    #[arg(long, env = "PROXY_TIMEOUT", default_value_t = 30_000)]
    pub timeout_ms: u64,

    /// Directory holding server.key plus server.crt / fullchain.crt (and
    /// optionally ca.crt).
    #[arg(long, env = "CERT_DIR", default_value = "certs")]
    pub cert_dir: PathBuf,

    /// Hostname substrings whose tunnels get the long idle window.
    #[arg(long, env = "WS_IDLE_PATTERNS", value_delimiter = ',')]
    pub ws_idle_pattern: Vec<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Built once at startup; immutable and `Arc`-shared thereafter.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub ws_idle_timeout: Duration,
    /// Drain window for in-flight connections at shutdown.
    pub grace: Duration,
    pub cert_dir: PathBuf,
    pub ws_idle_patterns: Vec<String>,
    pub upstream: Upstream,
}

impl Config {
    pub fn from_cli(cli: &Cli, upstream: Upstream) -> Self {
        let timeout = Duration::from_millis(cli.timeout_ms.max(1));
        Config {
            port: cli.port,
            handshake_timeout: Duration::from_secs(45),
            dial_timeout: timeout,
            request_timeout: timeout,
            idle_timeout: Duration::from_secs(60),
            ws_idle_timeout: Duration::from_secs(120),
            grace: Duration::from_secs(5),
            cert_dir: cli.cert_dir.clone(),
            ws_idle_patterns: cli
                .ws_idle_pattern
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
            upstream,
        }
    }

    /// Tunnels likely to carry WebSockets idle out on the longer window:
    /// port 443 targets and hostnames matching the configured patterns.
    pub fn idle_for(&self, target: &TargetAuthority) -> Duration {
        if target.port == 443 || self.ws_idle_patterns.iter().any(|p| target.host.contains(p.as_str())) {
            self.ws_idle_timeout
        } else {
            self.idle_timeout
        }
    }
}
