use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::{self, File};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::mitm::tls_config::HTTP11_ALPN;

/// Load TLS certificates and private key from files
pub fn load_certs_and_key(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file =
        File::open(cert_path).with_context(|| format!("Failed to open certificate {}", cert_path))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {}", cert_path))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", cert_path);
    }

    let key_file =
        File::open(key_path).with_context(|| format!("Failed to open key {}", key_path))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .with_context(|| format!("Failed to parse private key in {}", key_path))?
        .ok_or_else(|| anyhow::anyhow!("No private keys found in {}", key_path))?;

    Ok((certs, key))
}

/// Read a CA certificate/key pair as PEM text
pub fn read_ca_pem(cert_path: &str, key_path: &str) -> Result<(String, String)> {
    let cert = fs::read_to_string(cert_path)
        .with_context(|| format!("Failed to read CA certificate {}", cert_path))?;
    let key = fs::read_to_string(key_path)
        .with_context(|| format!("Failed to read CA key {}", key_path))?;
    Ok((cert, key))
}

/// Create the acceptor for a TLS-terminating proxy listener
pub fn create_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let (certs, key) = load_certs_and_key(cert_path, key_path)?;

    let mut tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("Failed to create TLS config: {}", e))?;

    // The engine only speaks HTTP/1.1
    tls_config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::CertificateAuthority;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn self_signed() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    #[test]
    fn test_load_certs_and_key() {
        let (cert_pem, key_pem) = self_signed();
        let cert = write_temp(&cert_pem);
        let key = write_temp(&key_pem);

        let cert_path = cert.path().to_str().unwrap();
        let key_path = key.path().to_str().unwrap();
        let (certs, _key) = load_certs_and_key(cert_path, key_path).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_load_rejects_empty_files() {
        let (_, key_pem) = self_signed();
        let empty = write_temp("");
        let key = write_temp(&key_pem);

        let err = load_certs_and_key(empty.path().to_str().unwrap(), key.path().to_str().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("No certificates"));

        let (cert_pem, _) = self_signed();
        let cert = write_temp(&cert_pem);
        let err = load_certs_and_key(cert.path().to_str().unwrap(), empty.path().to_str().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("No private keys"));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load_certs_and_key("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn test_create_tls_acceptor_advertises_http11() {
        let (cert_pem, key_pem) = self_signed();
        let cert = write_temp(&cert_pem);
        let key = write_temp(&key_pem);

        let cert_path = cert.path().to_str().unwrap();
        let key_path = key.path().to_str().unwrap();
        let acceptor = create_tls_acceptor(cert_path, key_path).unwrap();
        assert_eq!(acceptor.config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_read_ca_pem_loads_authority() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![rcgen::KeyUsagePurpose::KeyCertSign];
        let ca = params.self_signed(&key).unwrap();

        let cert = write_temp(&ca.pem());
        let key = write_temp(&key.serialize_pem());

        let (cert_pem, key_pem) =
            read_ca_pem(cert.path().to_str().unwrap(), key.path().to_str().unwrap()).unwrap();
        assert!(CertificateAuthority::from_pem(&cert_pem, &key_pem).is_ok());
    }

    #[test]
    fn test_read_ca_pem_missing_file() {
        let err = read_ca_pem("/nonexistent/ca.pem", "/nonexistent/ca.key").unwrap_err();
        assert!(err.to_string().contains("CA certificate"));
    }
}
