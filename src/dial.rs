//! Outbound transport construction.
//!
//! Given a validated target and the resolved upstream descriptor, the
//! dialer returns one opaque byte-stream: plain TCP for direct targets,
//! a CONNECT tunnel through an HTTP or HTTPS upstream, a SOCKS4/SOCKS5
//! circuit, and optionally a client-TLS wrap around any of those for
//! forwarded `https:` fetches. Callers never learn what the stream is made
//! of.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::http::TargetAuthority;
use crate::upstream::{Credentials, Upstream};

/// Any transport the dialer can hand back.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// An open outbound stream plus any bytes the negotiation read past the
/// upstream's CONNECT response. The tunnel handler must deliver `early` to
/// the client before splicing starts.
pub struct Dialed {
    pub stream: Box<dyn ByteStream>,
    pub early: Vec<u8>,
}

/// What the caller intends to do with the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialUsage {
    /// Raw tunnel for a client CONNECT; bytes are opaque.
    ConnectTunnel,
    /// Plain-HTTP fetch; the caller writes the request itself.
    ForwardHttp,
    /// HTTPS fetch; the dialer wraps the stream in verified client TLS.
    ForwardHttps,
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {0} timed out")]
    Timeout(String),
    #[error("connect to {0} failed: {1}")]
    Refused(String, #[source] io::Error),
    #[error("upstream negotiation failed: {0}")]
    Negotiation(String),
    #[error("TLS to {0} failed: {1}")]
    OriginTls(String, String),
}

pub struct Dialer {
    upstream: Upstream,
    connect_timeout: Duration,
    tls: Arc<rustls::ClientConfig>,
}

impl Dialer {
    pub fn new(upstream: Upstream, connect_timeout: Duration, tls: Arc<rustls::ClientConfig>) -> Self {
        Dialer { upstream, connect_timeout, tls }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Open a stream to `target` per the upstream/usage matrix. On any
    /// negotiation failure the partial sockets are dropped and a typed
    /// error comes back; nothing has been written to the client.
    pub async fn dial(&self, target: &TargetAuthority, usage: DialUsage) -> Result<Dialed, DialError> {
        match &self.upstream {
            Upstream::Direct => self.dial_direct(target, usage).await,
            Upstream::Http { host, port, creds } => {
                self.dial_via_http(host, *port, creds.as_ref(), false, target, usage).await
            }
            Upstream::Https { host, port, creds } => {
                self.dial_via_http(host, *port, creds.as_ref(), true, target, usage).await
            }
            Upstream::Socks5 { host, port, creds } => {
                self.dial_via_socks5(host, *port, creds.as_ref(), target, usage).await
            }
            Upstream::Socks4 { host, port } => {
                self.dial_via_socks4(host, *port, target, usage).await
            }
        }
    }

    async fn dial_direct(&self, target: &TargetAuthority, usage: DialUsage) -> Result<Dialed, DialError> {
        let tcp = self.tcp_connect(&target.host, target.port).await?;
        let stream: Box<dyn ByteStream> = match usage {
            DialUsage::ForwardHttps => Box::new(self.tls_wrap(&target.host, tcp).await?),
            _ => Box::new(tcp),
        };
        Ok(Dialed { stream, early: Vec::new() })
    }

    async fn dial_via_http(
        &self,
        proxy_host: &str,
        proxy_port: u16,
        creds: Option<&Credentials>,
        tls_upstream: bool,
        target: &TargetAuthority,
        usage: DialUsage,
    ) -> Result<Dialed, DialError> {
        let tcp = self.tcp_connect(proxy_host, proxy_port).await?;
        let mut stream: Box<dyn ByteStream> = if tls_upstream {
            Box::new(self.tls_wrap(proxy_host, tcp).await?)
        } else {
            Box::new(tcp)
        };

        if usage == DialUsage::ForwardHttp {
            // Proxy-form request rides the upstream leg directly; the
            // caller constructs it.
            return Ok(Dialed { stream, early: Vec::new() });
        }

        let early = timeout(
            self.connect_timeout,
            connect_exchange(&mut *stream, target, creds),
        )
        .await
        .map_err(|_| DialError::Timeout(target.to_string()))??;

        if usage == DialUsage::ForwardHttps {
            let stream: Box<dyn ByteStream> = if early.is_empty() {
                stream
            } else {
                Box::new(Prefixed::new(early, stream))
            };
            let wrapped = self.tls_wrap(&target.host, stream).await?;
            return Ok(Dialed { stream: Box::new(wrapped), early: Vec::new() });
        }

        Ok(Dialed { stream, early })
    }

    async fn dial_via_socks5(
        &self,
        proxy_host: &str,
        proxy_port: u16,
        creds: Option<&Credentials>,
        target: &TargetAuthority,
        usage: DialUsage,
    ) -> Result<Dialed, DialError> {
        let mut tcp = self.tcp_connect(proxy_host, proxy_port).await?;
        timeout(self.connect_timeout, socks5_connect(&mut tcp, target, creds))
            .await
            .map_err(|_| DialError::Timeout(target.to_string()))??;

        let stream: Box<dyn ByteStream> = match usage {
            DialUsage::ForwardHttps => Box::new(self.tls_wrap(&target.host, tcp).await?),
            _ => Box::new(tcp),
        };
        Ok(Dialed { stream, early: Vec::new() })
    }

    async fn dial_via_socks4(
        &self,
        proxy_host: &str,
        proxy_port: u16,
        target: &TargetAuthority,
        usage: DialUsage,
    ) -> Result<Dialed, DialError> {
        let mut tcp = self.tcp_connect(proxy_host, proxy_port).await?;
        timeout(self.connect_timeout, socks4_connect(&mut tcp, target))
            .await
            .map_err(|_| DialError::Timeout(target.to_string()))??;

        let stream: Box<dyn ByteStream> = match usage {
            DialUsage::ForwardHttps => Box::new(self.tls_wrap(&target.host, tcp).await?),
            _ => Box::new(tcp),
        };
        Ok(Dialed { stream, early: Vec::new() })
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DialError::Timeout(format!("{host}:{port}")))?
            .map_err(|e| DialError::Refused(format!("{host}:{port}"), e))?;
        socket_hygiene(&stream);
        Ok(stream)
    }

    /// Client-TLS wrap with certificate verification against the root
    /// store. Used both for `https:` origins and for TLS upstream legs.
    async fn tls_wrap<S>(&self, host: &str, stream: S) -> Result<tokio_rustls::client::TlsStream<S>, DialError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let connector = TlsConnector::from(self.tls.clone());
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| DialError::OriginTls(host.to_string(), "not a valid TLS server name".into()))?;
        timeout(self.connect_timeout, connector.connect(name, stream))
            .await
            .map_err(|_| DialError::Timeout(host.to_string()))?
            .map_err(|e| DialError::OriginTls(host.to_string(), e.to_string()))
    }
}

/// Keepalive probes at 30 s and Nagle off, on every proxied socket.
pub fn socket_hygiene(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = sock.set_tcp_keepalive(&keepalive);
}

/// Issue `CONNECT target` on an upstream leg and require a 2xx. Returns
/// whatever bytes arrived past the response terminator.
async fn connect_exchange<S>(
    stream: &mut S,
    target: &TargetAuthority,
    creds: Option<&Credentials>,
) -> Result<Vec<u8>, DialError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let authority = target.to_string();
    let mut req = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(c) = creds {
        let token = BASE64.encode(format!("{}:{}", c.user, c.pass));
        req.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    req.push_str("\r\n");

    stream
        .write_all(req.as_bytes())
        .await
        .map_err(|e| DialError::Negotiation(format!("writing CONNECT: {e}")))?;

    read_connect_reply(stream).await
}

async fn read_connect_reply<S>(stream: &mut S) -> Result<Vec<u8>, DialError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut tmp = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 8192 {
            return Err(DialError::Negotiation("oversized CONNECT response".into()));
        }
        let n = stream
            .read(&mut tmp)
            .await
            .map_err(|e| DialError::Negotiation(format!("reading CONNECT response: {e}")))?;
        if n == 0 {
            return Err(DialError::Negotiation("upstream closed during CONNECT".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    resp.parse(&buf[..head_end])
        .map_err(|e| DialError::Negotiation(format!("bad CONNECT response: {e}")))?;
    match resp.code {
        Some(code) if (200..300).contains(&code) => Ok(buf[head_end..].to_vec()),
        Some(code) => Err(DialError::Negotiation(format!(
            "upstream refused CONNECT with status {code}"
        ))),
        None => Err(DialError::Negotiation("incomplete CONNECT response".into())),
    }
}

const SOCKS5: u8 = 0x05;

async fn socks5_connect<S>(
    stream: &mut S,
    target: &TargetAuthority,
    creds: Option<&Credentials>,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let err = |msg: String| DialError::Negotiation(format!("socks5: {msg}"));
    let io_err = |e: io::Error| DialError::Negotiation(format!("socks5: {e}"));

    // Greeting: offer no-auth, plus user/pass when we hold credentials.
    let methods: &[u8] = if creds.is_some() { &[0x00, 0x02] } else { &[0x00] };
    let mut greeting = vec![SOCKS5, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await.map_err(io_err)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(io_err)?;
    if choice[0] != SOCKS5 {
        return Err(err(format!("unexpected version {}", choice[0])));
    }
    match choice[1] {
        0x00 => {}
        0x02 => {
            let Some(c) = creds else {
                return Err(err("server demanded credentials we do not have".into()));
            };
            if c.user.len() > 255 || c.pass.len() > 255 {
                return Err(err("credentials too long".into()));
            }
            // RFC 1929 username/password subnegotiation.
            let mut auth = vec![0x01, c.user.len() as u8];
            auth.extend_from_slice(c.user.as_bytes());
            auth.push(c.pass.len() as u8);
            auth.extend_from_slice(c.pass.as_bytes());
            stream.write_all(&auth).await.map_err(io_err)?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await.map_err(io_err)?;
            if status[1] != 0x00 {
                return Err(err("authentication rejected".into()));
            }
        }
        other => return Err(err(format!("no acceptable auth method (got {other:#04x})"))),
    }

    // CONNECT command; send the hostname unresolved unless it is a literal IP.
    let mut req = vec![SOCKS5, 0x01, 0x00];
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => {
                req.push(0x01);
                req.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                req.push(0x04);
                req.extend_from_slice(&v6.octets());
            }
        }
    } else {
        if target.host.len() > 255 {
            return Err(err("hostname too long for SOCKS5".into()));
        }
        req.push(0x03);
        req.push(target.host.len() as u8);
        req.extend_from_slice(target.host.as_bytes());
    }
    req.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&req).await.map_err(io_err)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(io_err)?;
    if head[0] != SOCKS5 {
        return Err(err(format!("unexpected reply version {}", head[0])));
    }
    if head[1] != 0x00 {
        return Err(err(format!("connect rejected with status {:#04x}", head[1])));
    }

    // Drain the bound address the server reports.
    let remaining = match head[3] {
        0x01 => 4 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_err)?;
            len[0] as usize + 2
        }
        0x04 => 16 + 2,
        other => return Err(err(format!("unknown bound address type {other:#04x}"))),
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await.map_err(io_err)?;

    Ok(())
}

async fn socks4_connect<S>(stream: &mut S, target: &TargetAuthority) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let err = |msg: String| DialError::Negotiation(format!("socks4: {msg}"));
    let io_err = |e: io::Error| DialError::Negotiation(format!("socks4: {e}"));

    // SOCKS4 frames carry a raw IPv4 address; resolve the hostname first.
    let ip4 = if let Ok(IpAddr::V4(v4)) = target.host.parse::<IpAddr>() {
        v4
    } else {
        let addrs = lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(io_err)?;
        addrs
            .filter_map(|a| match a {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| err(format!("{} has no IPv4 address", target.host)))?
    };

    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&target.port.to_be_bytes());
    req.extend_from_slice(&ip4.octets());
    req.push(0x00);
    stream.write_all(&req).await.map_err(io_err)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.map_err(io_err)?;
    if reply[1] != 0x5A {
        return Err(err(format!("connect rejected with status {:#04x}", reply[1])));
    }
    Ok(())
}

/// Replays bytes consumed during negotiation before reading from the inner
/// stream; writes pass straight through.
pub struct Prefixed<S> {
    head: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    pub fn new(head: Vec<u8>, inner: S) -> Self {
        Prefixed { head, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.head.len() {
            let available = self.head.len() - self.pos;
            let to_copy = available.min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.head[start..start + to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn target(host: &str, port: u16) -> TargetAuthority {
        TargetAuthority { host: host.into(), port }
    }

    #[tokio::test]
    async fn connect_exchange_sends_auth_and_returns_early_bytes() {
        let (mut ours, mut theirs) = duplex(4096);
        let creds = Credentials { user: "u".into(), pass: "p".into() };
        let t = target("t.test", 443);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = theirs.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            theirs
                .write_all(b"HTTP/1.1 200 OK\r\n\r\n\x16\x03\x01")
                .await
                .unwrap();
            head
        });

        let early = connect_exchange(&mut ours, &t, Some(&creds)).await.unwrap();
        assert_eq!(early, b"\x16\x03\x01");

        let head = server.await.unwrap();
        assert!(head.starts_with("CONNECT t.test:443 HTTP/1.1\r\n"));
        assert!(head.contains("Host: t.test:443\r\n"));
        // base64("u:p") == "dTpw"
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[tokio::test]
    async fn connect_exchange_rejects_non_2xx() {
        let (mut ours, mut theirs) = duplex(4096);
        let t = target("t.test", 443);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = theirs.read(&mut buf).await.unwrap();
            theirs
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = connect_exchange(&mut ours, &t, None).await.unwrap_err();
        assert!(matches!(err, DialError::Negotiation(_)));
    }

    #[tokio::test]
    async fn socks5_domain_connect_round_trip() {
        let (mut ours, mut theirs) = duplex(4096);
        let t = target("example.test", 8443);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            theirs.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            theirs.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            theirs.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            theirs.read_exact(&mut rest).await.unwrap();
            let name = String::from_utf8_lossy(&rest[..head[4] as usize]).to_string();
            let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);

            // Reply with an IPv4 bound address.
            theirs
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
                .await
                .unwrap();
            (name, port)
        });

        socks5_connect(&mut ours, &t, None).await.unwrap();
        let (name, port) = server.await.unwrap();
        assert_eq!(name, "example.test");
        assert_eq!(port, 8443);
    }

    #[tokio::test]
    async fn socks5_auth_subnegotiation() {
        let (mut ours, mut theirs) = duplex(4096);
        let t = target("example.test", 443);
        let creds = Credentials { user: "bob".into(), pass: "hunter2".into() };

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            theirs.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            theirs.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = vec![0u8; 2 + 3 + 1 + 7];
            theirs.read_exact(&mut auth).await.unwrap();
            assert_eq!(auth[0], 0x01);
            assert_eq!(&auth[2..5], b"bob");
            assert_eq!(&auth[6..], b"hunter2");
            theirs.write_all(&[0x01, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            theirs.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            theirs.read_exact(&mut rest).await.unwrap();
            theirs
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        socks5_connect(&mut ours, &t, Some(&creds)).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn socks5_rejection_is_an_error() {
        let (mut ours, mut theirs) = duplex(4096);
        let t = target("example.test", 443);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            theirs.read_exact(&mut greeting).await.unwrap();
            theirs.write_all(&[0x05, 0x00]).await.unwrap();
            let mut head = [0u8; 5];
            theirs.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            theirs.read_exact(&mut rest).await.unwrap();
            // host unreachable
            theirs
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = socks5_connect(&mut ours, &t, None).await.unwrap_err();
        assert!(matches!(err, DialError::Negotiation(_)));
    }

    #[tokio::test]
    async fn socks4_literal_ip_connect() {
        let (mut ours, mut theirs) = duplex(4096);
        let t = target("127.0.0.1", 8080);

        let server = tokio::spawn(async move {
            let mut req = [0u8; 9];
            theirs.read_exact(&mut req).await.unwrap();
            assert_eq!(req[0], 0x04);
            assert_eq!(req[1], 0x01);
            assert_eq!(u16::from_be_bytes([req[2], req[3]]), 8080);
            assert_eq!(&req[4..8], &[127, 0, 0, 1]);
            assert_eq!(req[8], 0x00);
            theirs
                .write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        socks4_connect(&mut ours, &t).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn prefixed_replays_head_before_inner() {
        let (inner_ours, mut inner_theirs) = duplex(64);
        inner_theirs.write_all(b" world").await.unwrap();

        let mut stream = Prefixed::new(b"hello".to_vec(), inner_ours);
        let mut out = vec![0u8; 11];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }
}
