//! HTTPS client for the upstream CA
//!
//! Speaks the CA's JSON API: `POST /1.0/sign` with a CSR and one-time token,
//! `POST /1.0/renew` under client-certificate authentication, and
//! `GET /1.0/roots`. Sessions pin the CA root named by the bootstrap token's
//! `sha` claim and rotate their trust store when the renewer installs fresh
//! roots.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::provisioner::{decode_claims, Provisioner};
use super::{
    der_to_pem, fingerprint, pem_bundle_to_der, pem_to_der, Authority, AuthoritySession, CaError,
    CertificateChain, ClientIdentity,
};
use crate::config::ProvisionerConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Authority backed by a remote CA over HTTPS
pub struct CaClient {
    provisioner: Provisioner,
    base_url: String,
    root_pem: String,
}

impl CaClient {
    /// Creates a client for the CA named in the provisioner configuration.
    pub fn new(provisioner: Provisioner, config: &ProvisionerConfig) -> Result<CaClient, CaError> {
        let root_pem = std::fs::read_to_string(&config.ca_root).map_err(|e| {
            CaError::pki(format!("error reading {}: {e}", config.ca_root.display()))
        })?;
        // make sure the root parses before we pin it
        pem_to_der(&root_pem)?;
        Ok(CaClient {
            provisioner,
            base_url: config.ca_url.trim_end_matches('/').to_string(),
            root_pem,
        })
    }
}

#[async_trait]
impl Authority for CaClient {
    async fn issue_token(&self, subject: &str) -> Result<String, CaError> {
        self.provisioner.sign_token(subject)
    }

    async fn bootstrap(&self, token: &str) -> Result<Arc<dyn AuthoritySession>, CaError> {
        let claims = decode_claims(token)?;
        let root_der = pem_to_der(&self.root_pem)?;
        if !claims.sha.eq_ignore_ascii_case(&fingerprint(&root_der)) {
            return Err(CaError::bootstrap(format!(
                "token root fingerprint {} does not match the configured root",
                claims.sha
            )));
        }
        let client = build_client(&self.root_pem, None)?;
        Ok(Arc::new(HttpSession {
            base_url: self.base_url.clone(),
            transport: RwLock::new(Transport {
                roots_pem: self.root_pem.clone(),
                client,
            }),
        }))
    }
}

struct Transport {
    roots_pem: String,
    client: reqwest::Client,
}

/// A session against the CA's HTTP API
struct HttpSession {
    base_url: String,
    transport: RwLock<Transport>,
}

impl HttpSession {
    fn snapshot(&self) -> (String, reqwest::Client) {
        let guard = self.transport.read().unwrap_or_else(|e| e.into_inner());
        (guard.roots_pem.clone(), guard.client.clone())
    }
}

#[async_trait]
impl AuthoritySession for HttpSession {
    async fn sign(&self, token: &str, csr_pem: &str) -> Result<CertificateChain, CaError> {
        let (_, client) = self.snapshot();
        let res = client
            .post(format!("{}/1.0/sign", self.base_url))
            .json(&SignRequest { csr: csr_pem, ott: token })
            .send()
            .await?;
        let body: SignResponse = parse(res, "sign").await.map_err(as_sign_error)?;
        body.into_chain()
    }

    async fn renew(&self, identity: &ClientIdentity) -> Result<CertificateChain, CaError> {
        let (roots_pem, _) = self.snapshot();
        let client_identity =
            reqwest::Identity::from_pem(format!("{}{}", identity.chain_pem, identity.key_pem).as_bytes())
                .map_err(|e| CaError::Renew(format!("failed to load client identity: {e}")))?;
        let client = build_client(&roots_pem, Some(client_identity))?;
        let res = client
            .post(format!("{}/1.0/renew", self.base_url))
            .send()
            .await?;
        let body: SignResponse = parse(res, "renew").await.map_err(as_renew_error)?;
        body.into_chain()
    }

    async fn roots(&self) -> Result<Vec<Vec<u8>>, CaError> {
        let (_, client) = self.snapshot();
        let res = client
            .get(format!("{}/1.0/roots", self.base_url))
            .send()
            .await?;
        let body: RootsResponse = parse(res, "roots")
            .await
            .map_err(|e| CaError::Roots(e.to_string()))?;
        let mut roots = Vec::with_capacity(body.crts.len());
        for pem in &body.crts {
            roots.push(pem_to_der(pem).map_err(|e| CaError::Roots(e.to_string()))?);
        }
        Ok(roots)
    }

    fn set_roots(&self, roots: &[Vec<u8>]) -> Result<(), CaError> {
        let roots_pem: String = roots.iter().map(|der| der_to_pem(der)).collect();
        let client = build_client(&roots_pem, None)?;
        let mut guard = self.transport.write().unwrap_or_else(|e| e.into_inner());
        guard.roots_pem = roots_pem;
        guard.client = client;
        Ok(())
    }
}

/// Builds an HTTPS client trusting the given PEM roots, optionally with a
/// client identity, using the transport defaults the CA expects.
fn build_client(
    roots_pem: &str,
    identity: Option<reqwest::Identity>,
) -> Result<reqwest::Client, CaError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);
    for der in pem_bundle_to_der(roots_pem)? {
        let cert = reqwest::Certificate::from_der(&der)
            .map_err(|e| CaError::pki(format!("failed to load root certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }
    if let Some(identity) = identity {
        builder = builder.identity(identity);
    }
    Ok(builder.build()?)
}

async fn parse<T: serde::de::DeserializeOwned>(
    res: reqwest::Response,
    operation: &str,
) -> Result<T, CaError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(CaError::pki(format!(
            "{operation} request failed with {status}: {body}"
        )));
    }
    res.json::<T>()
        .await
        .map_err(|e| CaError::pki(format!("error parsing {operation} response: {e}")))
}

fn as_sign_error(err: CaError) -> CaError {
    CaError::Sign(err.to_string())
}

fn as_renew_error(err: CaError) -> CaError {
    CaError::Renew(err.to_string())
}

#[derive(Serialize)]
struct SignRequest<'a> {
    csr: &'a str,
    ott: &'a str,
}

#[derive(Deserialize)]
struct SignResponse {
    crt: String,
    ca: String,
    #[serde(rename = "certChain", default)]
    cert_chain: Option<Vec<String>>,
}

impl SignResponse {
    fn into_chain(self) -> Result<CertificateChain, CaError> {
        let pems = match &self.cert_chain {
            Some(chain) if !chain.is_empty() => chain.clone(),
            _ => vec![self.crt, self.ca],
        };
        let mut certificates = Vec::with_capacity(pems.len());
        for pem in &pems {
            certificates.push(pem_to_der(pem)?);
        }
        Ok(CertificateChain { certificates })
    }
}

#[derive(Deserialize)]
struct RootsResponse {
    crts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_response_prefers_explicit_chain() {
        let leaf = der_to_pem(b"leaf");
        let intermediate = der_to_pem(b"intermediate");
        let res = SignResponse {
            crt: leaf.clone(),
            ca: intermediate.clone(),
            cert_chain: Some(vec![leaf, intermediate, der_to_pem(b"root")]),
        };
        let chain = res.into_chain().unwrap();
        assert_eq!(chain.certificates.len(), 3);
        assert_eq!(chain.leaf().unwrap(), b"leaf");
    }

    #[test]
    fn sign_response_falls_back_to_crt_and_ca() {
        let res = SignResponse {
            crt: der_to_pem(b"leaf"),
            ca: der_to_pem(b"intermediate"),
            cert_chain: None,
        };
        let chain = res.into_chain().unwrap();
        assert_eq!(
            chain.certificates,
            vec![b"leaf".to_vec(), b"intermediate".to_vec()]
        );
    }

    #[test]
    fn roots_response_parses() {
        let raw = serde_json::json!({"crts": [der_to_pem(b"root-a"), der_to_pem(b"root-b")]});
        let res: RootsResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(res.crts.len(), 2);
    }

    #[test]
    fn transport_roots_rotate() {
        let ca = crate::ca::MiniCa::new("Transport CA").unwrap();
        let session = HttpSession {
            base_url: "https://ca.example.com".to_string(),
            transport: RwLock::new(Transport {
                roots_pem: ca.root_pem().to_string(),
                client: build_client(ca.root_pem(), None).unwrap(),
            }),
        };

        let next = crate::ca::MiniCa::new("Rotated CA").unwrap();
        let next_der = pem_to_der(next.root_pem()).unwrap();
        session.set_roots(std::slice::from_ref(&next_der)).unwrap();

        let (roots_pem, _) = session.snapshot();
        assert_eq!(pem_bundle_to_der(&roots_pem).unwrap(), vec![next_der]);
    }
}
