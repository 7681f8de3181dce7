//! Provisioner tokens
//!
//! The provisioner is the credential that lets this service request
//! certificates for arbitrary subjects: an ES256 signing key registered with
//! the upstream CA under an issuer name and key id. Every resource name on a
//! stream gets its own short-lived, single-subject JWT.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{decrypt_private_key, fingerprint, pem_to_der, CaError};
use crate::config::ProvisionerConfig;

/// Token lifetime. The CA only needs the token to survive the sign request.
const TOKEN_LIFETIME_SECS: i64 = 5 * 60;

/// Claims carried by a one-time provisioning token
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer: the provisioner name
    pub iss: String,
    /// Subject: the resource name the certificate is for
    pub sub: String,
    /// Audience: the CA sign endpoint
    pub aud: String,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Not before (unix seconds)
    pub nbf: i64,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Unique token id
    pub jti: String,
    /// Subject alternative names requested for the certificate
    #[serde(default)]
    pub sans: Vec<String>,
    /// SHA-256 fingerprint of the CA root the holder should trust
    #[serde(default)]
    pub sha: String,
}

/// Mints one-time CA tokens with the configured provisioner key
pub struct Provisioner {
    issuer: String,
    key_id: String,
    audience: String,
    encoding_key: EncodingKey,
    root_fingerprint: String,
}

impl Provisioner {
    /// Loads the provisioner signing key and pinned root from the
    /// configuration. An `ENCRYPTED PRIVATE KEY` file is decrypted with the
    /// configured password.
    pub fn new(config: &ProvisionerConfig) -> Result<Provisioner, CaError> {
        let root_pem = std::fs::read_to_string(&config.ca_root).map_err(|e| {
            CaError::pki(format!("error reading {}: {e}", config.ca_root.display()))
        })?;
        let root_der = pem_to_der(&root_pem)?;

        let key_path = config
            .key
            .as_ref()
            .ok_or_else(|| CaError::token("provisioner.key is not configured"))?;
        let key_pem = std::fs::read_to_string(key_path)
            .map_err(|e| CaError::pki(format!("error reading {}: {e}", key_path.display())))?;
        let key_pem = decrypt_private_key(&key_pem, config.password.as_deref())?;
        let encoding_key = EncodingKey::from_ec_pem(key_pem.as_bytes())
            .map_err(|e| CaError::token(format!("failed to load provisioner key: {e}")))?;

        Ok(Provisioner {
            issuer: config.issuer.clone(),
            key_id: config.key_id.clone(),
            audience: format!("{}/1.0/sign", config.ca_url.trim_end_matches('/')),
            encoding_key,
            root_fingerprint: fingerprint(&root_der),
        })
    }

    /// Mints a one-time token for the given subject.
    pub fn sign_token(&self, subject: &str) -> Result<String, CaError> {
        let now = Utc::now().timestamp();
        let mut jti = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut jti)
            .map_err(|e| CaError::token(format!("failed to generate token id: {e}")))?;

        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: self.audience.clone(),
            exp: now + TOKEN_LIFETIME_SECS,
            nbf: now,
            iat: now,
            jti: hex::encode(jti),
            sans: vec![subject.to_string()],
            sha: self.root_fingerprint.clone(),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| CaError::token(format!("failed to sign token: {e}")))
    }

    /// Fingerprint of the pinned CA root.
    pub fn root_fingerprint(&self) -> &str {
        &self.root_fingerprint
    }
}

/// Decodes a token's claims without verifying its signature. The CA is the
/// party that verifies tokens; the holder only needs to route on them.
pub fn decode_claims(token: &str) -> Result<TokenClaims, CaError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| CaError::token("malformed token"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| CaError::token(format!("error parsing token: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| CaError::token(format!("error parsing token: {e}")))
}

/// The subject a token was minted for.
pub fn token_subject(token: &str) -> Result<String, CaError> {
    Ok(decode_claims(token)?.sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionerConfig;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    fn test_provisioner(password: Option<&str>) -> (Provisioner, Vec<u8>) {
        let ca = crate::ca::MiniCa::new("Provisioner Test CA").unwrap();
        let root = write_temp(ca.root_pem());

        let key_pem = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let stored = crate::ca::serialize_private_key(&key_pem, password).unwrap();
        let key = write_temp(&stored);

        let config = ProvisionerConfig {
            issuer: "sds@example.com".to_string(),
            key_id: "test-kid".to_string(),
            password: password.map(str::to_string),
            ca_url: "https://ca.example.com/".to_string(),
            ca_root: root.path().to_path_buf(),
            key: Some(key.path().to_path_buf()),
        };
        // the provisioner reads both files eagerly, so the temp files can go
        let provisioner = Provisioner::new(&config).unwrap();
        let root_der = pem_to_der(ca.root_pem()).unwrap();
        (provisioner, root_der)
    }

    #[test]
    fn tokens_carry_subject_and_pinned_root() {
        let (provisioner, root_der) = test_provisioner(None);
        let token = provisioner.sign_token("foo.example").unwrap();

        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.iss, "sds@example.com");
        assert_eq!(claims.sub, "foo.example");
        assert_eq!(claims.aud, "https://ca.example.com/1.0/sign");
        assert_eq!(claims.sans, vec!["foo.example".to_string()]);
        assert_eq!(claims.sha, fingerprint(&root_der));
        assert_eq!(claims.jti.len(), 64);
        assert!(claims.exp > claims.iat);
        assert_eq!(token_subject(&token).unwrap(), "foo.example");
    }

    #[test]
    fn tokens_are_unique_per_request() {
        let (provisioner, _) = test_provisioner(None);
        let a = provisioner.sign_token("foo.example").unwrap();
        let b = provisioner.sign_token("foo.example").unwrap();
        assert_ne!(
            decode_claims(&a).unwrap().jti,
            decode_claims(&b).unwrap().jti
        );
    }

    #[test]
    fn encrypted_provisioner_keys_are_supported() {
        let (provisioner, _) = test_provisioner(Some("secret"));
        let token = provisioner.sign_token("bar.example").unwrap();
        assert_eq!(token_subject(&token).unwrap(), "bar.example");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(decode_claims("not-a-token").is_err());
        assert!(decode_claims("a.b.c").is_err());
        assert!(token_subject("").is_err());
    }
}
