//! Upstream certificate authority
//!
//! The service never signs data-plane certificates itself: it mints one-time
//! tokens with a provisioner credential and asks the upstream CA to sign,
//! renew and publish roots. The CA is modeled as a pair of object-safe
//! traits so the renewer and the service are independent of the wire
//! protocol: [`client`] talks JSON over HTTPS to a real CA, [`local`] is an
//! embedded mini-CA used by `init` and the test suite.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod client;
pub mod local;
pub mod provisioner;

pub use client::CaClient;
pub use local::{LocalAuthority, MiniCa};
pub use provisioner::Provisioner;

/// CA interaction errors
#[derive(Debug, Error)]
pub enum CaError {
    /// One-time token could not be minted or parsed
    #[error("token error: {0}")]
    Token(String),

    /// CA client could not be established from a token
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// CSR signing failed
    #[error("sign error: {0}")]
    Sign(String),

    /// Certificate renewal failed
    #[error("renew error: {0}")]
    Renew(String),

    /// Root certificates could not be fetched
    #[error("roots error: {0}")]
    Roots(String),

    /// Key or certificate material could not be created or parsed
    #[error("PKI error: {0}")]
    Pki(String),

    /// HTTP transport failure
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CaError {
    /// Create a token error with the given message
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }

    /// Create a bootstrap error with the given message
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }
}

/// A certificate chain returned by the CA: DER certificates, leaf first,
/// followed by its issuing intermediates.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    /// DER-encoded certificates, leaf first
    pub certificates: Vec<Vec<u8>>,
}

impl CertificateChain {
    /// The leaf certificate of the chain.
    pub fn leaf(&self) -> Result<&[u8], CaError> {
        self.certificates
            .first()
            .map(Vec::as_slice)
            .ok_or_else(|| CaError::pki("empty certificate chain"))
    }

    /// The whole chain as concatenated PEM blocks.
    pub fn to_pem(&self) -> String {
        self.certificates.iter().map(|der| der_to_pem(der)).collect()
    }
}

/// The client-authentication material a certificate holder presents to the
/// CA when renewing: its current chain and private key, both PEM.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// PEM certificate chain, leaf first
    pub chain_pem: String,
    /// PEM private key
    pub key_pem: String,
}

/// Token-minting side of the CA: the provisioner credential this service
/// holds, plus session establishment.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authority: Send + Sync {
    /// Issues a short-lived one-time token bound to `subject`.
    async fn issue_token(&self, subject: &str) -> Result<String, CaError>;

    /// Establishes a CA session from a one-time token; the token carries the
    /// fingerprint of the root the session must trust.
    async fn bootstrap(&self, token: &str) -> Result<Arc<dyn AuthoritySession>, CaError>;
}

/// An established session against the CA.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthoritySession: Send + Sync {
    /// Submits a CSR together with its one-time token and returns the signed
    /// chain.
    async fn sign(&self, token: &str, csr_pem: &str) -> Result<CertificateChain, CaError>;

    /// Renews a certificate using the certificate itself as transport
    /// client authentication.
    async fn renew(&self, identity: &ClientIdentity) -> Result<CertificateChain, CaError>;

    /// Fetches the current root certificates (DER).
    async fn roots(&self) -> Result<Vec<Vec<u8>>, CaError>;

    /// Rotates the roots the session's transport trusts.
    fn set_roots(&self, roots: &[Vec<u8>]) -> Result<(), CaError>;
}

/// Lowercase hex SHA-256 fingerprint of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Wraps DER bytes in a `CERTIFICATE` PEM block.
pub fn der_to_pem(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()))
}

/// Parses a single PEM block and returns its DER contents.
pub fn pem_to_der(data: &str) -> Result<Vec<u8>, CaError> {
    let block = pem::parse(data).map_err(|e| CaError::pki(format!("failed to parse PEM: {e}")))?;
    Ok(block.contents().to_vec())
}

/// Parses a PEM bundle into the DER contents of every block.
pub fn pem_bundle_to_der(data: &str) -> Result<Vec<Vec<u8>>, CaError> {
    let blocks =
        pem::parse_many(data).map_err(|e| CaError::pki(format!("failed to parse PEM: {e}")))?;
    if blocks.is_empty() {
        return Err(CaError::pki("no PEM blocks found"));
    }
    Ok(blocks.into_iter().map(|b| b.contents().to_vec()).collect())
}

/// Serializes a PKCS#8 private key PEM, encrypting it when a password is
/// given.
pub fn serialize_private_key(key_pem: &str, password: Option<&str>) -> Result<String, CaError> {
    let Some(password) = password else {
        return Ok(key_pem.to_string());
    };
    let der = pem_block_to_der(key_pem)?;
    let info = pkcs8::PrivateKeyInfo::try_from(der.as_slice())
        .map_err(|e| CaError::pki(format!("failed to parse PKCS#8 key: {e}")))?;
    let doc = info
        .encrypt(rand::rngs::OsRng, password.as_bytes())
        .map_err(|e| CaError::pki(format!("failed to encrypt key: {e}")))?;
    let pem = doc
        .to_pem("ENCRYPTED PRIVATE KEY", pkcs8::LineEnding::LF)
        .map_err(|e| CaError::pki(format!("failed to serialize key: {e}")))?;
    Ok(pem.to_string())
}

/// Reads a PEM private key, decrypting an `ENCRYPTED PRIVATE KEY` block with
/// the given password. Returns an unencrypted PKCS#8 PEM.
pub fn decrypt_private_key(key_pem: &str, password: Option<&str>) -> Result<String, CaError> {
    if !key_pem.contains("ENCRYPTED PRIVATE KEY") {
        return Ok(key_pem.to_string());
    }
    let password =
        password.ok_or_else(|| CaError::pki("private key is encrypted but no password given"))?;
    let der = pem_block_to_der(key_pem)?;
    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice())
        .map_err(|e| CaError::pki(format!("failed to parse encrypted key: {e}")))?;
    let doc = info
        .decrypt(password.as_bytes())
        .map_err(|e| CaError::pki(format!("failed to decrypt key: {e}")))?;
    let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", doc.as_bytes().to_vec()));
    Ok(pem)
}

fn pem_block_to_der(data: &str) -> Result<Vec<u8>, CaError> {
    let block = pem::parse(data).map_err(|e| CaError::pki(format!("failed to parse PEM: {e}")))?;
    Ok(block.contents().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_lowercase_hex() {
        let fp = fingerprint(b"certificate bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn pem_round_trip() {
        let pem = der_to_pem(b"some der");
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(pem_to_der(&pem).unwrap(), b"some der");
    }

    #[test]
    fn pem_bundles_keep_order() {
        let bundle = format!("{}{}", der_to_pem(b"first"), der_to_pem(b"second"));
        let ders = pem_bundle_to_der(&bundle).unwrap();
        assert_eq!(ders, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn empty_bundle_is_an_error() {
        assert!(pem_bundle_to_der("").is_err());
    }

    #[test]
    fn key_encryption_round_trip() {
        let key = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let encrypted = serialize_private_key(&key, Some("password")).unwrap();
        assert!(encrypted.contains("ENCRYPTED PRIVATE KEY"));

        let decrypted = decrypt_private_key(&encrypted, Some("password")).unwrap();
        assert!(decrypted.contains("BEGIN PRIVATE KEY"));
        assert_eq!(pem_block_to_der(&decrypted).unwrap(), pem_block_to_der(&key).unwrap());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let key = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let encrypted = serialize_private_key(&key, Some("password")).unwrap();
        assert!(decrypt_private_key(&encrypted, Some("wrong")).is_err());
        assert!(decrypt_private_key(&encrypted, None).is_err());
    }

    #[test]
    fn plaintext_keys_pass_through() {
        let key = rcgen::KeyPair::generate().unwrap().serialize_pem();
        assert_eq!(decrypt_private_key(&key, None).unwrap(), key);
        assert_eq!(serialize_private_key(&key, None).unwrap(), key);
    }

    #[test]
    fn chain_leaf_and_pem() {
        let chain = CertificateChain {
            certificates: vec![b"leaf".to_vec(), b"intermediate".to_vec()],
        };
        assert_eq!(chain.leaf().unwrap(), b"leaf");
        let pems = pem::parse_many(chain.to_pem()).unwrap();
        assert_eq!(pems.len(), 2);
        assert_eq!(pems[0].contents(), b"leaf");

        let empty = CertificateChain { certificates: vec![] };
        assert!(empty.leaf().is_err());
    }
}
