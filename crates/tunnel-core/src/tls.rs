//! TLS configuration helpers.
//!
//! These build already-validated `rustls` configs from in-memory PEM bytes.
//! Reading key material off disk is left to the embedding application (the
//! demo binary does this the way the teacher's `main.rs::load_tls_config`
//! does), so the core never touches the filesystem.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{TunnelError, TunnelResult};

/// ALPN token advertised by the multiplexed transport (HTTP/2).
pub const ALPN_H2: &[u8] = b"h2";

/// Parse one or more PEM-encoded certificates.
pub fn parse_certs(pem: &[u8]) -> TunnelResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Configuration(format!("invalid certificate PEM: {e}")))
}

/// Parse a single PEM-encoded private key.
pub fn parse_private_key(pem: &[u8]) -> TunnelResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TunnelError::Configuration(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| TunnelError::Configuration("no private key found in PEM".to_string()))
}

/// Build a root store from one or more PEM-encoded CA certificates.
pub fn root_store(ca_pem: &[u8]) -> TunnelResult<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in parse_certs(ca_pem)? {
        store
            .add(cert)
            .map_err(|e| TunnelError::Configuration(format!("invalid CA certificate: {e}")))?;
    }
    Ok(store)
}

/// Build the server-side TLS config: requires and verifies a client
/// certificate against `ca_roots`, advertises ALPN `"h2"`, and pins the
/// minimum protocol version to TLS 1.2.
pub fn server_tls_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_roots: RootCertStore,
) -> TunnelResult<ServerConfig> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(ca_roots))
        .build()
        .map_err(|e| TunnelError::Configuration(format!("client verifier setup failed: {e}")))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)
        .map_err(|e| TunnelError::Configuration(format!("invalid server certificate/key: {e}")))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(config)
}

/// Build the client-side TLS config: presents `cert_chain`/`key` for mutual
/// authentication, verifies the server against `ca_roots`, advertises ALPN
/// `"h2"`.
pub fn client_tls_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_roots: RootCertStore,
) -> TunnelResult<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(ca_roots)
        .with_client_auth_cert(cert_chain, key)
        .map_err(|e| TunnelError::Configuration(format!("invalid client certificate/key: {e}")))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a self-signed cert/key pair and use it as its own trust root,
    /// the way a single test fixture can stand in for both leaf and CA.
    fn self_signed_pair() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, RootCertStore) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("self-signed cert generation");
        let cert_pem = cert.cert.pem();
        let key_pem = cert.key_pair.serialize_pem();

        let chain = parse_certs(cert_pem.as_bytes()).unwrap();
        let key = parse_private_key(key_pem.as_bytes()).unwrap();
        let roots = root_store(cert_pem.as_bytes()).unwrap();
        (chain, key, roots)
    }

    #[test]
    fn server_config_builds_with_a_trusted_client_cert() {
        let (chain, key, roots) = self_signed_pair();
        let config = server_tls_config(chain, key, roots);
        assert!(config.is_ok());
        assert_eq!(config.unwrap().alpn_protocols, vec![ALPN_H2.to_vec()]);
    }

    #[test]
    fn client_config_builds_with_a_trusted_server_cert() {
        let (chain, key, roots) = self_signed_pair();
        let config = client_tls_config(chain, key, roots);
        assert!(config.is_ok());
        assert_eq!(config.unwrap().alpn_protocols, vec![ALPN_H2.to_vec()]);
    }
}
