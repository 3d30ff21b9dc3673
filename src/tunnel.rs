//! The CONNECT tunnel handler.
//!
//! Validates the authority, dials the target, acknowledges the tunnel with
//! the fixed `200 Connection Established` block, flushes any bytes either
//! side already produced, and hands both streams to the splicer. After the
//! 200 is on the wire the client is in tunnel mode and HTTP framing no
//! longer applies, so later failures are logged but never reported back.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::Config;
use crate::dial::{DialError, DialUsage, Dialer};
use crate::http::{write_plain_response, RequestEnvelope, TargetAuthority};
use crate::splice::splice;

pub const PROXY_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The exact tunnel acknowledgement, byte for byte.
pub fn established_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 200 Connection Established\r\n\
         Proxy-agent: {PROXY_AGENT}\r\n\
         Connection: keep-alive\r\n\
         Keep-Alive: timeout=60, max=1000\r\n\
         Proxy-Connection: keep-alive\r\n\r\n"
    )
    .into_bytes()
}

pub async fn handle<S>(mut client: S, envelope: RequestEnvelope, dialer: &Dialer, cfg: &Config)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // No dial happens unless the authority validates.
    let target = match TargetAuthority::parse(&envelope.target) {
        Ok(t) => t,
        Err(e) => {
            debug!("rejecting CONNECT {:?}: {e}", envelope.target);
            write_plain_response(&mut client, 400, "Bad Request", &format!("invalid CONNECT target: {e}\n")).await;
            return;
        }
    };

    let dialed = match dialer.dial(&target, DialUsage::ConnectTunnel).await {
        Ok(d) => d,
        Err(e @ DialError::Timeout(_)) => {
            info!("CONNECT {target}: {e}");
            write_plain_response(&mut client, 504, "Gateway Timeout", &format!("{e}\n")).await;
            return;
        }
        Err(e) => {
            info!("CONNECT {target}: {e}");
            write_plain_response(&mut client, 502, "Bad Gateway", &format!("{e}\n")).await;
            return;
        }
    };
    let mut outbound = dialed.stream;

    // A dead client surfaces as a write error here; nothing to report.
    if client.write_all(&established_response()).await.is_err() {
        debug!("CONNECT {target}: client went away before the 200");
        return;
    }

    // Bytes past the CONNECT terminator are the front of the tunneled
    // ClientHello and must reach the target before the splice starts; the
    // symmetric rule applies to bytes the dialer over-read from upstream.
    if !envelope.leftover.is_empty() && outbound.write_all(&envelope.leftover).await.is_err() {
        debug!("CONNECT {target}: target closed while flushing client preamble");
        return;
    }
    if !dialed.early.is_empty() && client.write_all(&dialed.early).await.is_err() {
        debug!("CONNECT {target}: client closed while flushing upstream preamble");
        return;
    }

    let idle = cfg.idle_for(&target);
    let tag = target.to_string();
    let outcome = splice(client, outbound, idle, &tag).await;
    info!(
        "tunnel {tag} closed ({:?}): {} bytes up, {} bytes down",
        outcome.end, outcome.a_to_b, outcome.b_to_a
    );
}
