//! Peer identity: a content-addressed identifier derived from a client's
//! leaf X.509 certificate.
//!
//! The identifier is the SHA-256 digest of the certificate's DER encoding.
//! Either peer can compute the other's identifier independently from the
//! TLS handshake; no registry or prior agreement is required to name a
//! peer, only to authorize one.

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};

use crate::error::{TunnelError, TunnelResult};

const DIGEST_LEN: usize = 32;
const GROUP_LEN: usize = 7;

/// A 32-byte peer identifier, the SHA-256 of a DER-encoded leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; DIGEST_LEN]);

impl Identity {
    /// Compute the identifier of a certificate given its raw DER bytes.
    pub fn from_certificate_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&digest);
        Identity(bytes)
    }

    /// Extract the peer's leaf certificate from a completed TLS session and
    /// compute its identifier.
    pub fn from_peer_certificates(
        peer_certs: Option<&[rustls::pki_types::CertificateDer<'_>]>,
    ) -> TunnelResult<Self> {
        let leaf = peer_certs
            .and_then(|certs| certs.first())
            .ok_or(TunnelError::NoPeerCertificate)?;
        Ok(Self::from_certificate_der(leaf.as_ref()))
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Encode as the canonical dash-grouped base32 textual form, upper-case.
    pub fn encode(&self) -> String {
        let plain = BASE32_NOPAD.encode(&self.0);
        group(&plain)
    }

    /// Decode the canonical textual form (case-insensitive, dashes optional).
    pub fn decode(text: &str) -> TunnelResult<Self> {
        let stripped: String = text.chars().filter(|c| *c != '-').collect();
        let upper = stripped.to_ascii_uppercase();
        let decoded = BASE32_NOPAD
            .decode(upper.as_bytes())
            .map_err(|e| TunnelError::BadIdentifier(e.to_string()))?;
        if decoded.len() != DIGEST_LEN {
            return Err(TunnelError::BadIdentifier(format!(
                "expected {DIGEST_LEN} bytes, got {}",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Identity(bytes))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

fn group(plain: &str) -> String {
    plain
        .as_bytes()
        .chunks(GROUP_LEN)
        .map(|chunk| std::str::from_utf8(chunk).expect("ascii"))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_text() {
        let id = Identity::from_certificate_der(b"a fake certificate body");
        let text = id.encode();
        assert_eq!(Identity::decode(&text).unwrap(), id);
    }

    #[test]
    fn decode_is_case_insensitive() {
        let id = Identity::from_certificate_der(b"another certificate");
        let text = id.encode();
        assert_eq!(Identity::decode(&text.to_ascii_lowercase()).unwrap(), id);
    }

    #[test]
    fn decode_accepts_without_dashes() {
        let id = Identity::from_certificate_der(b"yet another certificate");
        let text = id.encode();
        let no_dashes: String = text.chars().filter(|c| *c != '-').collect();
        assert_eq!(Identity::decode(&no_dashes).unwrap(), id);
    }

    #[test]
    fn encode_is_grouped_by_seven() {
        let id = Identity::from_certificate_der(b"grouping test");
        let text = id.encode();
        let groups: Vec<&str> = text.split('-').collect();
        assert_eq!(groups.len(), 8);
        for g in &groups[..7] {
            assert_eq!(g.len(), 7);
        }
        assert_eq!(groups[7].len(), 3);
    }

    #[test]
    fn decode_rejects_bad_length() {
        assert!(Identity::decode("AAAA").is_err());
    }

    #[test]
    fn decode_rejects_non_base32() {
        let id = Identity::from_certificate_der(b"bad char test");
        let mut text = id.encode();
        text.replace_range(0..1, "0"); // '0' is not in the RFC4648 base32 alphabet
        assert!(Identity::decode(&text).is_err());
    }

    #[test]
    fn different_certs_yield_different_identities() {
        let a = Identity::from_certificate_der(b"cert a");
        let b = Identity::from_certificate_der(b"cert b");
        assert_ne!(a, b);
    }
}
