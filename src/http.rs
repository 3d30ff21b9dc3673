//! HTTP/1.1 request heads and target authorities.
//!
//! The proxy only ever parses the request *head* itself; everything after
//! the `\r\n\r\n` terminator is opaque payload that belongs to the tunnel
//! or to the forwarded body and is preserved verbatim in
//! [`RequestEnvelope::leftover`].

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_HEAD_BYTES: usize = 32 * 1024;

/// A parsed request head plus any bytes read past its terminator.
#[derive(Debug)]
pub struct RequestEnvelope {
    pub method: String,
    /// Authority for CONNECT, absolute URL or origin-form path otherwise.
    pub target: String,
    /// Case-preserving; values are raw bytes.
    pub headers: Vec<(String, Vec<u8>)>,
    /// For CONNECT this is the front of the tunneled ClientHello; for a
    /// forwarded request it is the front of the body.
    pub leftover: Vec<u8>,
}

impl RequestEnvelope {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("connection closed before a complete request head")]
    Truncated,
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("malformed request head: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read and parse one request head off the stream.
pub async fn read_envelope<S>(stream: &mut S) -> Result<RequestEnvelope, ParseError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_terminator(&buf) {
            break pos + 4;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ParseError::HeadTooLarge);
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(ParseError::Truncated);
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&buf[..head_end])? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(ParseError::Truncated),
    }

    let method = req.method.ok_or(ParseError::Invalid("missing method"))?.to_string();
    let target = req.path.ok_or(ParseError::Invalid("missing request target"))?.to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect();

    Ok(RequestEnvelope { method, target, headers, leftover: buf[head_end..].to_vec() })
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Which path a parsed request takes through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `CONNECT host:port` — open a tunnel and splice.
    ConnectTunnel,
    /// Absolute-URI proxy request — fetch on the client's behalf.
    Forward,
    /// Origin-form `OPTIONS` — answer the CORS pre-flight directly.
    Preflight,
    /// Any other origin-form request — serve the status page.
    StatusPage,
}

pub fn dispatch(envelope: &RequestEnvelope) -> RequestKind {
    if envelope.method.eq_ignore_ascii_case("CONNECT") {
        RequestKind::ConnectTunnel
    } else if envelope.target.contains("://") {
        RequestKind::Forward
    } else if envelope.method.eq_ignore_ascii_case("OPTIONS") {
        RequestKind::Preflight
    } else {
        RequestKind::StatusPage
    }
}

/// A validated `host:port` dial target. Never dialed unless validation
/// passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAuthority {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("empty host")]
    EmptyHost,
    #[error("hostname longer than 253 characters")]
    HostTooLong,
    #[error("hostname contains a forbidden character")]
    BadHostChar,
    #[error("invalid bracketed IPv6 address")]
    BadIpv6,
    #[error("port out of range")]
    BadPort,
}

impl TargetAuthority {
    /// Parse a CONNECT authority: `host:port`, `[v6]:port`, or a bare host
    /// which defaults to port 443.
    pub fn parse(raw: &str) -> Result<Self, AuthorityError> {
        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let end = rest.find(']').ok_or(AuthorityError::BadIpv6)?;
            let host = &rest[..end];
            if host.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(AuthorityError::BadIpv6);
            }
            let tail = &rest[end + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p),
                None if tail.is_empty() => None,
                None => return Err(AuthorityError::BadPort),
            };
            (host.to_string(), port)
        } else {
            let (host, port) = match raw.rsplit_once(':') {
                Some((h, p)) => (h.to_string(), Some(p)),
                None => (raw.to_string(), None),
            };
            if !host.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-') {
                return Err(AuthorityError::BadHostChar);
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(AuthorityError::EmptyHost);
        }
        if host.len() > 253 {
            return Err(AuthorityError::HostTooLong);
        }

        let port = match port {
            None => 443,
            Some(p) => match p.parse::<u16>() {
                Ok(n) if n > 0 => n,
                _ => return Err(AuthorityError::BadPort),
            },
        };

        Ok(TargetAuthority { host, port })
    }
}

impl fmt::Display for TargetAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Write a plain-text error response, then close cleanly. These responses
/// always end the connection, and the shutdown lets TLS clients see a
/// close_notify instead of a truncated stream.
pub async fn write_plain_response<S>(stream: &mut S, status: u16, reason: &str, body: &str)
where
    S: AsyncWrite + Unpin,
{
    let resp = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(resp.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Write a 200 `text/html` response, then close cleanly.
pub async fn write_html_response<S>(stream: &mut S, html: &str)
where
    S: AsyncWrite + Unpin,
{
    let resp = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{html}",
        html.len()
    );
    let _ = stream.write_all(resp.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Answer an `OPTIONS` pre-flight with permissive CORS headers, then close
/// cleanly.
pub async fn write_cors_preflight<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let resp = "HTTP/1.1 200 OK\r\n\
                Access-Control-Allow-Origin: *\r\n\
                Access-Control-Allow-Methods: *\r\n\
                Access-Control-Allow-Headers: *\r\n\
                Content-Length: 0\r\n\
                Connection: close\r\n\r\n";
    let _ = stream.write_all(resp.as_bytes()).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_connect_and_preserves_leftover() {
        let raw = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n\x16\x03\x01\x02\x00";
        let envelope = read_envelope(&mut &raw[..]).await.unwrap();
        assert_eq!(envelope.method, "CONNECT");
        assert_eq!(envelope.target, "example.test:443");
        assert_eq!(envelope.header("host").unwrap(), b"example.test:443");
        assert_eq!(envelope.leftover, b"\x16\x03\x01\x02\x00");
        assert_eq!(dispatch(&envelope), RequestKind::ConnectTunnel);
    }

    #[tokio::test]
    async fn parses_absolute_uri_with_case_preserved_headers() {
        let raw = b"GET http://origin.test/ping HTTP/1.1\r\nHost: proxy\r\nX-Custom-Thing: 1\r\n\r\n";
        let envelope = read_envelope(&mut &raw[..]).await.unwrap();
        assert_eq!(envelope.method, "GET");
        assert_eq!(envelope.target, "http://origin.test/ping");
        assert!(envelope.headers.iter().any(|(n, _)| n == "X-Custom-Thing"));
        assert!(envelope.leftover.is_empty());
        assert_eq!(dispatch(&envelope), RequestKind::Forward);
    }

    #[tokio::test]
    async fn origin_form_dispatch() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: here\r\n\r\n";
        let envelope = read_envelope(&mut &raw[..]).await.unwrap();
        assert_eq!(dispatch(&envelope), RequestKind::StatusPage);

        let raw = b"OPTIONS / HTTP/1.1\r\nHost: here\r\n\r\n";
        let envelope = read_envelope(&mut &raw[..]).await.unwrap();
        assert_eq!(dispatch(&envelope), RequestKind::Preflight);
    }

    #[tokio::test]
    async fn truncated_head_is_rejected() {
        let raw = b"GET / HTTP/1.1\r\nHost: half";
        let err = read_envelope(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, ParseError::Truncated));
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 1024));
        let err = read_envelope(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, ParseError::HeadTooLarge));
    }

    #[test]
    fn authority_accepts_host_port() {
        let auth = TargetAuthority::parse("example.test:8443").unwrap();
        assert_eq!(auth.host, "example.test");
        assert_eq!(auth.port, 8443);
        assert_eq!(auth.to_string(), "example.test:8443");
    }

    #[test]
    fn bare_host_defaults_to_443() {
        let auth = TargetAuthority::parse("example.test").unwrap();
        assert_eq!(auth.port, 443);
    }

    #[test]
    fn bracketed_ipv6_round_trips() {
        let auth = TargetAuthority::parse("[2001:db8::1]:8443").unwrap();
        assert_eq!(auth.host, "2001:db8::1");
        assert_eq!(auth.port, 8443);
        assert_eq!(auth.to_string(), "[2001:db8::1]:8443");

        let auth = TargetAuthority::parse("[::1]").unwrap();
        assert_eq!(auth.port, 443);
    }

    #[test]
    fn rejections() {
        assert_eq!(TargetAuthority::parse("bad|host:443"), Err(AuthorityError::BadHostChar));
        assert_eq!(TargetAuthority::parse(":443"), Err(AuthorityError::EmptyHost));
        assert_eq!(TargetAuthority::parse("host:0"), Err(AuthorityError::BadPort));
        assert_eq!(TargetAuthority::parse("host:70000"), Err(AuthorityError::BadPort));
        assert_eq!(TargetAuthority::parse("host:https"), Err(AuthorityError::BadPort));
        assert_eq!(TargetAuthority::parse("[not-v6]:443"), Err(AuthorityError::BadIpv6));
        let long = format!("{}:443", "a".repeat(254));
        assert_eq!(TargetAuthority::parse(&long), Err(AuthorityError::HostTooLong));
    }
}
