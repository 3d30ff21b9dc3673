//! Error classification.
//!
//! Every component funnels its low-level I/O and TLS failures through
//! [`classify`] and picks log verbosity from the returned class. Clients
//! that probe with plaintext HTTP or disconnect mid-handshake are the
//! dominant background noise and must never produce error-level logs.

use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Disposition buckets for low-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Background noise: resets, broken pipes, clients gone mid-handshake.
    BenignDrop,
    /// Worth a log line at normal verbosity.
    Report,
    /// Non-TLS or legacy-version bytes arrived on the TLS port.
    SslVersionMismatch,
    /// The peer does not trust our certificate authority.
    SslUnknownCa,
    Timeout,
    /// Listener-level trouble; the supervisor has to react.
    Fatal,
}

/// Map an I/O error (possibly wrapping a rustls error) to its class.
pub fn classify(err: &io::Error) -> ErrorClass {
    use io::ErrorKind::*;

    if let Some(tls) = rustls_source(err) {
        return classify_tls(tls);
    }
    match err.kind() {
        ConnectionReset | BrokenPipe | NotConnected | ConnectionAborted | UnexpectedEof => {
            ErrorClass::BenignDrop
        }
        TimedOut => ErrorClass::Timeout,
        OutOfMemory => ErrorClass::Fatal,
        _ => ErrorClass::Report,
    }
}

fn rustls_source(err: &io::Error) -> Option<&rustls::Error> {
    err.get_ref()?.downcast_ref::<rustls::Error>()
}

fn classify_tls(err: &rustls::Error) -> ErrorClass {
    use rustls::{AlertDescription, CertificateError, Error as Tls};

    match err {
        // Plaintext HTTP, SSLv2/v3 hellos and other garbage all surface as
        // invalid or inappropriate messages from the record layer.
        Tls::InvalidMessage(_)
        | Tls::InappropriateMessage { .. }
        | Tls::InappropriateHandshakeMessage { .. } => ErrorClass::SslVersionMismatch,
        Tls::AlertReceived(AlertDescription::UnknownCA)
        | Tls::AlertReceived(AlertDescription::BadCertificate)
        | Tls::AlertReceived(AlertDescription::CertificateUnknown) => ErrorClass::SslUnknownCa,
        Tls::AlertReceived(_) => ErrorClass::BenignDrop,
        Tls::InvalidCertificate(CertificateError::UnknownIssuer) => ErrorClass::SslUnknownCa,
        _ => ErrorClass::Report,
    }
}

const HINT_INTERVAL: Duration = Duration::from_secs(60);

static VERSION_HINT_AT: Mutex<Option<Instant>> = Mutex::new(None);
static CA_HINT_AT: Mutex<Option<Instant>> = Mutex::new(None);

fn hint_due(slot: &Mutex<Option<Instant>>) -> bool {
    let Ok(mut last) = slot.lock() else {
        return false;
    };
    let now = Instant::now();
    match *last {
        Some(at) if now.duration_since(at) < HINT_INTERVAL => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

/// Rate-limited operator hint for `SslVersionMismatch` handshake failures.
pub fn hint_version_mismatch() {
    if hint_due(&VERSION_HINT_AT) {
        warn!(
            "clients are sending non-TLS or legacy-version bytes to the TLS port; \
             likely causes: an HTTP client pointed at the HTTPS proxy port, or a \
             client too old to negotiate a supported TLS version"
        );
    }
}

/// Rate-limited operator hint for `SslUnknownCa` handshake failures.
pub fn hint_unknown_ca() {
    if hint_due(&CA_HINT_AT) {
        warn!(
            "clients are rejecting the proxy certificate chain; remediations: \
             disable verification in the client, point the client at the CA file, \
             or install the CA certificate system-wide"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err(kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, "synthetic")
    }

    fn tls_err(inner: rustls::Error) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, inner)
    }

    #[test]
    fn benign_kinds() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert_eq!(classify(&io_err(kind)), ErrorClass::BenignDrop, "{kind:?}");
        }
    }

    #[test]
    fn timeouts_and_reports() {
        assert_eq!(classify(&io_err(io::ErrorKind::TimedOut)), ErrorClass::Timeout);
        assert_eq!(classify(&io_err(io::ErrorKind::PermissionDenied)), ErrorClass::Report);
        assert_eq!(classify(&io_err(io::ErrorKind::AddrInUse)), ErrorClass::Report);
    }

    #[test]
    fn plaintext_on_tls_port_is_version_mismatch() {
        let err = tls_err(rustls::Error::InvalidMessage(
            rustls::InvalidMessage::InvalidContentType,
        ));
        assert_eq!(classify(&err), ErrorClass::SslVersionMismatch);
    }

    #[test]
    fn unknown_ca_alert() {
        let err = tls_err(rustls::Error::AlertReceived(
            rustls::AlertDescription::UnknownCA,
        ));
        assert_eq!(classify(&err), ErrorClass::SslUnknownCa);
    }

    #[test]
    fn other_alerts_are_benign() {
        let err = tls_err(rustls::Error::AlertReceived(
            rustls::AlertDescription::CloseNotify,
        ));
        assert_eq!(classify(&err), ErrorClass::BenignDrop);
    }
}
