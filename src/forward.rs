//! The forward-fetch handler for absolute-URI proxy requests.
//!
//! The proxy performs the origin request on the client's behalf: it
//! rewrites the head (proxy headers stripped, `Host` set to the target
//! authority), dials a transport for the URL scheme, writes the head, and
//! then splices so the request body streams up and the origin's response
//! bytes stream back verbatim. Nothing is buffered; a mid-stream failure
//! truncates the response, which is the signal the client gets.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::dial::{DialError, DialUsage, Dialer};
use crate::http::{write_plain_response, RequestEnvelope, TargetAuthority};
use crate::splice::splice;
use crate::upstream::{Credentials, Upstream};

pub const ALLOWED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];

/// Hop-by-hop and proxy-control headers that never reach the origin.
const STRIPPED_HEADERS: [&str; 5] = [
    "host",
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "upgrade",
];

fn stripped(name: &str) -> bool {
    STRIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
        || name.to_ascii_lowercase().starts_with("sec-websocket-")
}

/// `Host` value for the outbound request: the URL authority minus default
/// ports (`url` reports a scheme-default port as absent and keeps IPv6
/// hosts bracketed).
fn host_value(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.to_string(),
    })
}

/// The guard against TLS records mis-read as an HTTP request: such heads
/// carry a missing, oversized, or binary `Host` header.
fn host_header_ok(envelope: &RequestEnvelope) -> bool {
    match envelope.header("host") {
        Some(v) => {
            !v.is_empty() && v.len() <= 255 && v.iter().all(|b| (0x20..0x7f).contains(b))
        }
        None => false,
    }
}

fn outbound_head(
    envelope: &RequestEnvelope,
    url: &Url,
    host: &str,
    proxy_form: bool,
    upstream_creds: Option<&Credentials>,
) -> Vec<u8> {
    let request_target = if proxy_form {
        // An HTTP upstream expects the absolute URL on the request line.
        url.as_str().to_string()
    } else {
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        path
    };

    let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", envelope.method, request_target, host).into_bytes();
    for (name, value) in &envelope.headers {
        if stripped(name) {
            continue;
        }
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value);
        head.extend_from_slice(b"\r\n");
    }
    if proxy_form {
        if let Some(c) = upstream_creds {
            use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
            let token = BASE64.encode(format!("{}:{}", c.user, c.pass));
            head.extend_from_slice(format!("Proxy-Authorization: Basic {token}\r\n").as_bytes());
        }
    }
    // EOF frames the exchange on the origin leg.
    head.extend_from_slice(b"Connection: close\r\n\r\n");
    head
}

pub async fn handle<S>(mut client: S, envelope: RequestEnvelope, dialer: &Dialer, cfg: &Config)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let url = match Url::parse(&envelope.target) {
        Ok(u) => u,
        Err(e) => {
            write_plain_response(&mut client, 400, "Bad Request", &format!("unparsable request URL: {e}\n")).await;
            return;
        }
    };
    let usage = match url.scheme() {
        "http" => DialUsage::ForwardHttp,
        "https" => DialUsage::ForwardHttps,
        other => {
            write_plain_response(
                &mut client,
                400,
                "Bad Request",
                &format!("unsupported scheme {other:?}; only http and https can be forwarded\n"),
            )
            .await;
            return;
        }
    };

    if !ALLOWED_METHODS.contains(&envelope.method.as_str()) {
        write_plain_response(&mut client, 405, "Method Not Allowed", "method not allowed\n").await;
        return;
    }

    if !host_header_ok(&envelope) {
        write_plain_response(
            &mut client,
            400,
            "Bad Request",
            "missing or malformed Host header; TLS targets need a CONNECT tunnel, not a proxied GET\n",
        )
        .await;
        return;
    }

    let (Some(host), Some(host_header)) = (url.host_str(), host_value(&url)) else {
        write_plain_response(&mut client, 400, "Bad Request", "request URL has no host\n").await;
        return;
    };
    let port = url.port_or_known_default().unwrap_or(80);
    let target = TargetAuthority { host: host.trim_matches(|c| c == '[' || c == ']').to_string(), port };

    let dialed = match dialer.dial(&target, usage).await {
        Ok(d) => d,
        Err(e @ DialError::Timeout(_)) => {
            info!("forward {target}: {e}");
            write_plain_response(&mut client, 504, "Gateway Timeout", &format!("{e}\n")).await;
            return;
        }
        Err(e) => {
            info!("forward {target}: {e}");
            write_plain_response(&mut client, 502, "Bad Gateway", &format!("{e}\n")).await;
            return;
        }
    };
    let mut outbound = dialed.stream;

    // Plain-http fetches riding an HTTP(S) upstream stay in proxy form and
    // carry the upstream's credentials.
    let proxy_form = usage == DialUsage::ForwardHttp
        && matches!(dialer.upstream(), Upstream::Http { .. } | Upstream::Https { .. });
    let upstream_creds = match dialer.upstream() {
        Upstream::Http { creds, .. } | Upstream::Https { creds, .. } => creds.as_ref(),
        _ => None,
    };

    let head = outbound_head(&envelope, &url, &host_header, proxy_form, upstream_creds);
    if let Err(e) = outbound.write_all(&head).await {
        debug!("forward {target}: failed to send request head: {e}");
        write_plain_response(&mut client, 502, "Bad Gateway", &format!("{e}\n")).await;
        return;
    }
    // Bytes past the request head are the front of the body.
    if !envelope.leftover.is_empty() {
        if let Err(e) = outbound.write_all(&envelope.leftover).await {
            debug!("forward {target}: failed to send buffered body bytes: {e}");
            write_plain_response(&mut client, 502, "Bad Gateway", &format!("{e}\n")).await;
            return;
        }
    }

    let tag = target.to_string();
    let outcome = splice(client, outbound, cfg.request_timeout, &tag).await;
    info!(
        "forward {tag} finished ({:?}): {} bytes up, {} bytes down",
        outcome.end, outcome.a_to_b, outcome.b_to_a
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestEnvelope {
        RequestEnvelope {
            method: method.into(),
            target: target.into(),
            headers: headers.iter().map(|(n, v)| (n.to_string(), v.as_bytes().to_vec())).collect(),
            leftover: Vec::new(),
        }
    }

    #[test]
    fn forbidden_headers_are_stripped() {
        for name in ["Host", "Proxy-Connection", "proxy-authorization", "Connection", "Upgrade", "Sec-WebSocket-Key", "Sec-WebSocket-Version"] {
            assert!(stripped(name), "{name} must be stripped");
        }
        for name in ["Accept", "Content-Length", "User-Agent", "Authorization", "Security-Policy"] {
            assert!(!stripped(name), "{name} must pass through");
        }
    }

    #[test]
    fn host_value_elides_default_ports() {
        assert_eq!(host_value(&Url::parse("http://origin.test/x").unwrap()).unwrap(), "origin.test");
        assert_eq!(host_value(&Url::parse("http://origin.test:80/x").unwrap()).unwrap(), "origin.test");
        assert_eq!(host_value(&Url::parse("https://origin.test:443/").unwrap()).unwrap(), "origin.test");
        assert_eq!(host_value(&Url::parse("http://origin.test:8080/").unwrap()).unwrap(), "origin.test:8080");
    }

    #[test]
    fn outbound_head_rewrites_and_sanitizes() {
        let env = envelope(
            "GET",
            "http://origin.test/ping?x=1",
            &[
                ("Host", "proxy.local"),
                ("Proxy-Connection", "keep-alive"),
                ("Accept", "*/*"),
                ("Sec-WebSocket-Key", "abc"),
            ],
        );
        let url = Url::parse(&env.target).unwrap();
        let head = outbound_head(&env, &url, "origin.test", false, None);
        let head = String::from_utf8(head).unwrap();

        assert!(head.starts_with("GET /ping?x=1 HTTP/1.1\r\nHost: origin.test\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
        assert!(!head.contains("Proxy-Connection"));
        assert!(!head.contains("Sec-WebSocket-Key"));
        assert!(!head.contains("proxy.local"));
    }

    #[test]
    fn proxy_form_keeps_absolute_url_and_adds_upstream_auth() {
        let env = envelope("GET", "http://origin.test/ping", &[("Host", "proxy.local")]);
        let url = Url::parse(&env.target).unwrap();
        let creds = Credentials { user: "u".into(), pass: "p".into() };
        let head = outbound_head(&env, &url, "origin.test", true, Some(&creds));
        let head = String::from_utf8(head).unwrap();

        assert!(head.starts_with("GET http://origin.test/ping HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[test]
    fn host_header_guard() {
        assert!(host_header_ok(&envelope("GET", "http://o.test/", &[("Host", "o.test")])));
        assert!(!host_header_ok(&envelope("GET", "http://o.test/", &[])));
        let long = "a".repeat(256);
        assert!(!host_header_ok(&envelope("GET", "http://o.test/", &[("Host", long.as_str())])));

        let mut env = envelope("GET", "http://o.test/", &[]);
        env.headers.push(("Host".into(), vec![0x00, 0x01, 0x02]));
        assert!(!host_header_ok(&env));
        let mut env = envelope("GET", "http://o.test/", &[]);
        env.headers.push(("Host".into(), vec![0x80, b'a']));
        assert!(!host_header_ok(&env));
    }
}
