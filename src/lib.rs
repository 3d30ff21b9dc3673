//! fwdgate — a local TLS-terminating forward proxy.
//!
//! Clients configure it as their HTTPS proxy. It accepts TLS connections on
//! a single port, services `CONNECT` tunnels and absolute-URI proxy
//! requests, and reaches origin servers either directly or through an
//! upstream HTTP, HTTPS, or SOCKS proxy.

pub mod classify;
pub mod config;
pub mod dial;
pub mod forward;
pub mod http;
pub mod server;
pub mod splice;
pub mod tls;
pub mod tunnel;
pub mod upstream;
