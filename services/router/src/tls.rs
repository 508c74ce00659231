//! Server-side TLS context.
//!
//! Loads a PEM certificate chain and private key into a rustls
//! `ServerConfig` backed by the ring provider. ALPN advertises `h2` first
//! so gRPC clients negotiate HTTP/2; `http/1.1` is accepted as well.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::ConfigError;

/// ALPN protocols offered to clients, in preference order.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Read every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ConfigError::Tls(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| ConfigError::Tls(format!("{}: no private key found", path.display())))
}

/// Build a server config from in-memory certificate and key.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Load certificate and key files into a TLS acceptor.
pub fn load_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, ConfigError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    Ok(TlsAcceptor::from(server_config(certs, key)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn self_signed() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_acceptor_from_pem_files() {
        let (cert_pem, key_pem) = self_signed();
        let cert_file = write_temp(&cert_pem);
        let key_file = write_temp(&key_pem);

        assert!(load_acceptor(cert_file.path(), key_file.path()).is_ok());
    }

    #[test]
    fn test_alpn_prefers_h2() {
        let (cert_pem, key_pem) = self_signed();
        let cert_file = write_temp(&cert_pem);
        let key_file = write_temp(&key_pem);

        let certs = load_certs(cert_file.path()).unwrap();
        let key = load_private_key(key_file.path()).unwrap();
        let config = server_config(certs, key).unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2".to_vec());
    }

    #[test]
    fn test_missing_file() {
        let err = load_certs(Path::new("/nonexistent/fullchain.cer")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_empty_pem() {
        let empty = write_temp("not a pem file\n");
        assert!(matches!(
            load_certs(empty.path()),
            Err(ConfigError::Tls(_))
        ));
        assert!(matches!(
            load_private_key(empty.path()),
            Err(ConfigError::Tls(_))
        ));
    }
}
