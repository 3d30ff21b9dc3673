//! TLS identity loading and rustls configuration.
//!
//! The inbound side presents one identity to every client (the SNI hint is
//! ignored) and never asks for client certificates. The outbound side
//! verifies origins against the bundled Mozilla roots and never relaxes
//! that check.

use std::{
    fs::File,
    io::BufReader,
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ClientConfig, RootCertStore, ServerConfig,
};
use rustls_pemfile::{certs, private_key};

/// The proxy's own key and certificate chain.
pub struct Identity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path.as_ref())
        .with_context(|| format!("failed to open {}", cert_path.as_ref().display()))?;
    let mut reader = BufReader::new(cert_file);
    let parsed: Result<Vec<CertificateDer>, _> = certs(&mut reader).collect();
    Ok(parsed?)
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path.as_ref())
        .with_context(|| format!("failed to open {}", key_path.as_ref().display()))?;
    let mut reader = BufReader::new(key_file);

    private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.as_ref().display()))
}

/// Load the TLS identity from `cert_dir`.
///
/// The key always comes from `server.key`. The chain comes from
/// `fullchain.crt` when that file exists, otherwise from `server.crt` with
/// `ca.crt` appended when present.
pub fn load_identity(cert_dir: &Path) -> Result<Identity> {
    let key = privkey_reader(cert_dir.join("server.key"))?;

    let fullchain = cert_dir.join("fullchain.crt");
    let chain = if fullchain.exists() {
        cert_reader(&fullchain)?
    } else {
        let mut chain = cert_reader(cert_dir.join("server.crt"))?;
        let ca = cert_dir.join("ca.crt");
        if ca.exists() {
            chain.extend(cert_reader(&ca)?);
        }
        chain
    };

    if chain.is_empty() {
        anyhow::bail!("no certificates found under {}", cert_dir.display());
    }
    Ok(Identity { chain, key })
}

/// Serves the one configured identity no matter which name the client asks
/// for.
#[derive(Debug)]
struct SingleIdentity(Arc<CertifiedKey>);

impl ResolvesServerCert for SingleIdentity {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Build the inbound server configuration.
///
/// No client certificates are requested and no protocol version is pinned;
/// every version rustls supports is negotiable.
pub fn build_server_config(identity: Identity) -> Result<ServerConfig> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let signing_key = provider
        .key_provider
        .load_private_key(identity.key)
        .map_err(|e| anyhow::anyhow!("unusable private key: {e}"))?;
    let certified = CertifiedKey::new(identity.chain, signing_key);

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleIdentity(Arc::new(certified))));

    Ok(config)
}

/// Build the outbound client configuration used for origin and upstream
/// TLS legs. Verification is against the bundled Mozilla roots.
pub fn build_client_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
