//! TLS acceptor setup for the server listener, when not running in
//! "insecure" mode. Loads a PEM certificate chain and private key from
//! disk; no ACME or dynamic cert sourcing (spec §1 explicitly keeps
//! certificate sourcing out of the tunnel core).

use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use warren_core::error::ProxyError;

/// Loads a PEM certificate chain and private key and builds a
/// server-side TLS acceptor for it.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<tokio_rustls::TlsAcceptor, ProxyError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("invalid TLS certificate/key: {e}")))?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Config(format!("cannot open cert file `{path}`: {e}")))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("cannot parse cert file `{path}`: {e}")))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Config(format!("cannot open key file `{path}`: {e}")))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Config(format!("cannot parse key file `{path}`: {e}")))?
        .ok_or_else(|| ProxyError::Config(format!("no private key found in `{path}`")))
}
