//! Embedded mini-CA
//!
//! A two-tier certificate authority (root + intermediate) built on `rcgen`.
//! `init` uses it to bootstrap the local PKI for the SDS listener and its
//! client; the test suite uses it through [`LocalAuthority`] to exercise the
//! full issuance and renewal path without a network.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngCore;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::provisioner::{token_subject, TokenClaims};
use super::{fingerprint, pem_to_der, Authority, AuthoritySession, CaError, CertificateChain, ClientIdentity};

/// Default leaf validity for locally issued certificates.
const DEFAULT_LEAF_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// A self-contained root + intermediate certificate authority
pub struct MiniCa {
    root_cert_pem: String,
    root_key_pem: String,
    intermediate_cert_pem: String,
    intermediate_key_pem: String,
    leaf_validity: Duration,
}

impl MiniCa {
    /// Creates a new CA named `name`, issuing leaves valid for 24 hours.
    pub fn new(name: &str) -> Result<MiniCa, CaError> {
        Self::with_leaf_validity(name, DEFAULT_LEAF_VALIDITY)
    }

    /// Creates a new CA issuing leaves with the given validity.
    pub fn with_leaf_validity(name: &str, leaf_validity: Duration) -> Result<MiniCa, CaError> {
        let root_key = generate_key()?;
        let mut root_params = ca_params(&format!("{name} Root CA"), BasicConstraints::Unconstrained)?;
        root_params.not_after = root_params.not_before + time::Duration::days(10 * 365);
        let root_cert = root_params
            .self_signed(&root_key)
            .map_err(|e| CaError::pki(format!("failed to create root certificate: {e}")))?;
        let root_cert_pem = root_cert.pem();

        let intermediate_key = generate_key()?;
        let mut int_params =
            ca_params(&format!("{name} Intermediate CA"), BasicConstraints::Constrained(0))?;
        int_params.not_after = int_params.not_before + time::Duration::days(5 * 365);
        let root_issuer = Issuer::from_ca_cert_pem(&root_cert_pem, &root_key)
            .map_err(|e| CaError::pki(format!("failed to create issuer: {e}")))?;
        let intermediate_cert = int_params
            .signed_by(&intermediate_key, &root_issuer)
            .map_err(|e| CaError::pki(format!("failed to sign intermediate: {e}")))?;

        Ok(MiniCa {
            root_cert_pem,
            root_key_pem: root_key.serialize_pem(),
            intermediate_cert_pem: intermediate_cert.pem(),
            intermediate_key_pem: intermediate_key.serialize_pem(),
            leaf_validity,
        })
    }

    /// The root certificate in PEM format.
    pub fn root_pem(&self) -> &str {
        &self.root_cert_pem
    }

    /// The root private key in PEM format.
    pub fn root_key_pem(&self) -> &str {
        &self.root_key_pem
    }

    /// The intermediate certificate in PEM format.
    pub fn intermediate_pem(&self) -> &str {
        &self.intermediate_cert_pem
    }

    /// The intermediate private key in PEM format.
    pub fn intermediate_key_pem(&self) -> &str {
        &self.intermediate_key_pem
    }

    /// The root certificate in DER format.
    pub fn root_der(&self) -> Result<Vec<u8>, CaError> {
        pem_to_der(&self.root_cert_pem)
    }

    /// Signs a CSR, overriding its subject and extensions. Returns the leaf
    /// certificate in PEM format.
    pub fn sign_csr(&self, csr_pem: &str, subject: &str) -> Result<String, CaError> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::Sign(format!("failed to parse CSR: {e}")))?;
        apply_leaf_params(&mut csr_params.params, subject, self.leaf_validity)?;

        let key = self.intermediate_key()?;
        let issuer = Issuer::from_ca_cert_pem(&self.intermediate_cert_pem, &key)
            .map_err(|e| CaError::pki(format!("failed to create issuer: {e}")))?;
        let cert = csr_params
            .signed_by(&issuer)
            .map_err(|e| CaError::Sign(format!("failed to sign certificate: {e}")))?;
        Ok(cert.pem())
    }

    /// Issues a fresh certificate for an existing key pair, keeping the
    /// subject but minting a new serial. This is the renewal path.
    pub fn reissue(&self, subject: &str, key_pem: &str) -> Result<String, CaError> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| CaError::Renew(format!("failed to load key: {e}")))?;
        let mut params = CertificateParams::default();
        apply_leaf_params(&mut params, subject, self.leaf_validity)?;

        let ca_key = self.intermediate_key()?;
        let issuer = Issuer::from_ca_cert_pem(&self.intermediate_cert_pem, &ca_key)
            .map_err(|e| CaError::pki(format!("failed to create issuer: {e}")))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| CaError::Renew(format!("failed to sign certificate: {e}")))?;
        Ok(cert.pem())
    }

    /// Generates a key pair and issues a certificate for `subject` with the
    /// given SANs and validity. Returns the PEM chain (leaf + intermediate)
    /// and the PEM private key.
    pub fn issue(
        &self,
        subject: &str,
        sans: &[String],
        validity: Duration,
    ) -> Result<(String, String), CaError> {
        let key = generate_key()?;
        let mut params = CertificateParams::default();
        apply_leaf_params(&mut params, subject, validity)?;
        params.subject_alt_names = san_list(sans)?;

        let ca_key = self.intermediate_key()?;
        let issuer = Issuer::from_ca_cert_pem(&self.intermediate_cert_pem, &ca_key)
            .map_err(|e| CaError::pki(format!("failed to create issuer: {e}")))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| CaError::Sign(format!("failed to sign certificate: {e}")))?;

        let chain_pem = format!("{}{}", cert.pem(), self.intermediate_cert_pem);
        Ok((chain_pem, key.serialize_pem()))
    }

    fn intermediate_key(&self) -> Result<KeyPair, CaError> {
        // KeyPair is not Clone, so it is re-parsed from PEM on each use
        KeyPair::from_pem(&self.intermediate_key_pem)
            .map_err(|e| CaError::pki(format!("failed to load intermediate key: {e}")))
    }
}

fn generate_key() -> Result<KeyPair, CaError> {
    KeyPair::generate().map_err(|e| CaError::pki(format!("failed to generate key: {e}")))
}

fn ca_params(common_name: &str, constraint: BasicConstraints) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(constraint);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(random_serial()?);
    params.not_before = time::OffsetDateTime::now_utc();
    Ok(params)
}

fn apply_leaf_params(
    params: &mut CertificateParams,
    subject: &str,
    validity: Duration,
) -> Result<(), CaError> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(subject.to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.serial_number = Some(random_serial()?);
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before
        + time::Duration::try_from(validity)
            .map_err(|e| CaError::pki(format!("invalid validity: {e}")))?;
    if params.subject_alt_names.is_empty() {
        params.subject_alt_names = san_list(std::slice::from_ref(&subject.to_string()))?;
    }
    Ok(())
}

fn san_list(names: &[String]) -> Result<Vec<SanType>, CaError> {
    let mut sans = Vec::with_capacity(names.len());
    for name in names {
        let san = match name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                Ia5String::try_from(name.clone())
                    .map_err(|e| CaError::pki(format!("invalid SAN {name}: {e}")))?,
            ),
        };
        sans.push(san);
    }
    Ok(sans)
}

fn random_serial() -> Result<SerialNumber, CaError> {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CaError::pki(format!("failed to generate serial: {e}")))?;
    Ok(SerialNumber::from(bytes.to_vec()))
}

/// In-process authority backed by a [`MiniCa`]
pub struct LocalAuthority {
    ca: Arc<MiniCa>,
    issuer: String,
    token_key: Vec<u8>,
}

impl LocalAuthority {
    /// Wraps a mini-CA as an authority.
    pub fn new(ca: MiniCa) -> LocalAuthority {
        let mut token_key = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut token_key);
        LocalAuthority {
            ca: Arc::new(ca),
            issuer: "local".to_string(),
            token_key,
        }
    }
}

#[async_trait]
impl Authority for LocalAuthority {
    async fn issue_token(&self, subject: &str) -> Result<String, CaError> {
        let now = Utc::now().timestamp();
        let mut jti = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut jti)
            .map_err(|e| CaError::token(format!("failed to generate token id: {e}")))?;
        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: "local".to_string(),
            exp: now + 300,
            nbf: now,
            iat: now,
            jti: hex::encode(jti),
            sans: vec![subject.to_string()],
            sha: fingerprint(&self.ca.root_der()?),
        };
        let key = EncodingKey::from_secret(&self.token_key);
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| CaError::token(format!("failed to sign token: {e}")))
    }

    async fn bootstrap(&self, token: &str) -> Result<Arc<dyn AuthoritySession>, CaError> {
        // sanity-check the token shape; the real verification happens when
        // the CA consumes it at sign time
        if token_subject(token)?.is_empty() {
            return Err(CaError::bootstrap("token has no subject"));
        }
        Ok(Arc::new(LocalSession {
            ca: self.ca.clone(),
            roots: RwLock::new(vec![self.ca.root_der()?]),
        }))
    }
}

struct LocalSession {
    ca: Arc<MiniCa>,
    roots: RwLock<Vec<Vec<u8>>>,
}

#[async_trait]
impl AuthoritySession for LocalSession {
    async fn sign(&self, token: &str, csr_pem: &str) -> Result<CertificateChain, CaError> {
        let subject = token_subject(token)?;
        let leaf_pem = self.ca.sign_csr(csr_pem, &subject)?;
        Ok(CertificateChain {
            certificates: vec![pem_to_der(&leaf_pem)?, pem_to_der(self.ca.intermediate_pem())?],
        })
    }

    async fn renew(&self, identity: &ClientIdentity) -> Result<CertificateChain, CaError> {
        let leaf_der = super::pem_bundle_to_der(&identity.chain_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| CaError::Renew("empty certificate chain".to_string()))?;
        let (_, cert) = X509Certificate::from_der(&leaf_der)
            .map_err(|e| CaError::Renew(format!("failed to parse certificate: {e}")))?;
        let subject = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| CaError::Renew("certificate has no common name".to_string()))?
            .to_string();

        let leaf_pem = self.ca.reissue(&subject, &identity.key_pem)?;
        Ok(CertificateChain {
            certificates: vec![pem_to_der(&leaf_pem)?, pem_to_der(self.ca.intermediate_pem())?],
        })
    }

    async fn roots(&self) -> Result<Vec<Vec<u8>>, CaError> {
        Ok(self.roots.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn set_roots(&self, roots: &[Vec<u8>]) -> Result<(), CaError> {
        *self.roots.write().unwrap_or_else(|e| e.into_inner()) = roots.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mini_ca_builds_a_two_tier_hierarchy() {
        let ca = MiniCa::new("Test").unwrap();
        assert!(ca.root_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.intermediate_pem().contains("BEGIN CERTIFICATE"));
        assert_ne!(ca.root_pem(), ca.intermediate_pem());
    }

    #[test]
    fn issued_certificates_carry_subject_and_sans() {
        let ca = MiniCa::new("Test").unwrap();
        let (chain_pem, key_pem) = ca
            .issue(
                "sds.example.com",
                &["sds.example.com".to_string(), "127.0.0.1".to_string()],
                Duration::from_secs(3600),
            )
            .unwrap();
        assert!(key_pem.contains("PRIVATE KEY"));

        let ders = super::super::pem_bundle_to_der(&chain_pem).unwrap();
        assert_eq!(ders.len(), 2);
        let (_, cert) = X509Certificate::from_der(&ders[0]).unwrap();
        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "sds.example.com");
    }

    #[test]
    fn reissue_changes_the_serial_but_not_the_subject() {
        let ca = MiniCa::new("Test").unwrap();
        let (chain_pem, key_pem) = ca
            .issue("foo.example", &["foo.example".to_string()], Duration::from_secs(3600))
            .unwrap();
        let first = super::super::pem_bundle_to_der(&chain_pem).unwrap().remove(0);

        let renewed_pem = ca.reissue("foo.example", &key_pem).unwrap();
        let renewed = pem_to_der(&renewed_pem).unwrap();

        let (_, a) = X509Certificate::from_der(&first).unwrap();
        let (_, b) = X509Certificate::from_der(&renewed).unwrap();
        assert_ne!(a.raw_serial(), b.raw_serial());
        assert_eq!(a.subject(), b.subject());
    }

    #[tokio::test]
    async fn local_authority_signs_and_renews() {
        let authority = LocalAuthority::new(MiniCa::new("Test").unwrap());
        let token = authority.issue_token("foo.example").await.unwrap();
        assert_eq!(token_subject(&token).unwrap(), "foo.example");

        let session = authority.bootstrap(&token).await.unwrap();
        let roots = session.roots().await.unwrap();
        assert_eq!(roots.len(), 1);

        let key = KeyPair::generate().unwrap();
        let csr = CertificateParams::default().serialize_request(&key).unwrap();
        let chain = session.sign(&token, &csr.pem().unwrap()).await.unwrap();
        assert_eq!(chain.certificates.len(), 2);

        let identity = ClientIdentity {
            chain_pem: chain.to_pem(),
            key_pem: key.serialize_pem(),
        };
        let renewed = session.renew(&identity).await.unwrap();
        let (_, a) = X509Certificate::from_der(chain.leaf().unwrap()).unwrap();
        let (_, b) = X509Certificate::from_der(renewed.leaf().unwrap()).unwrap();
        assert_ne!(a.raw_serial(), b.raw_serial());
    }

    #[tokio::test]
    async fn bootstrap_rejects_malformed_tokens() {
        let authority = LocalAuthority::new(MiniCa::new("Test").unwrap());
        assert!(authority.bootstrap("garbage").await.is_err());
    }
}
