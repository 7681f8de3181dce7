//! Certificate renewal
//!
//! One renewer serves one stream request: it bootstraps a CA session from
//! the first token, obtains the initial roots and certificates, then keeps
//! everything fresh on a timer. Renewed snapshots are published with a
//! non-blocking send; a consumer that misses a tick gets the then-current
//! state on the next one.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, SanType,
};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::is_validation_context;
use crate::ca::provisioner::token_subject;
use crate::ca::{Authority, AuthoritySession, CaError, CertificateChain, ClientIdentity};

/// Fraction of the renewal period to wait before retrying a failed renewal.
const RETRY_DIVISOR: u32 = 20;

/// A certificate tracked for a stream, in the form responses need it
#[derive(Debug, Clone)]
pub struct ServedCertificate {
    /// Resource name the certificate answers
    pub name: String,
    /// DER chain, leaf first
    pub chain: Vec<Vec<u8>>,
    /// Plaintext PEM private key
    pub private_key_pem: String,
    /// Lowercase hex serial of the leaf
    pub serial: String,
}

/// Roots and certificates captured at one point in time
#[derive(Debug, Clone, Default)]
pub struct SecretSnapshot {
    /// Current CA roots, DER
    pub roots: Vec<Vec<u8>>,
    /// Certificates in resource order (reserved names excluded)
    pub certificates: Vec<ServedCertificate>,
}

/// Obtains certificates for a set of tokens and renews them on a timer
#[derive(Debug)]
pub struct SecretRenewer {
    state: Arc<RwLock<SecretSnapshot>>,
    cancel: CancellationToken,
    renew_period: Duration,
}

impl SecretRenewer {
    /// Bootstraps a CA session from the first token, signs a certificate for
    /// every non-reserved token and arms the renewal timer. Returns the
    /// renewer and the channel renewed snapshots are published on.
    pub async fn new(
        authority: &dyn Authority,
        tokens: &[String],
        roots_refresh: Duration,
    ) -> Result<(SecretRenewer, mpsc::Receiver<SecretSnapshot>), CaError> {
        if tokens.is_empty() {
            return Err(CaError::token("missing tokens"));
        }

        let session = authority.bootstrap(&tokens[0]).await?;
        let roots = session.roots().await?;

        let mut certificates = Vec::new();
        let mut identities = Vec::new();
        let mut first_validity = None;
        for token in tokens {
            let subject = token_subject(token)?;
            if is_validation_context(&subject) {
                continue;
            }
            let (csr_pem, key_pem) = new_csr(&subject)?;
            let chain = session.sign(token, &csr_pem).await?;
            let (served, identity, validity) = materialize(&subject, chain, key_pem)?;
            first_validity.get_or_insert(validity);
            certificates.push(served);
            identities.push(identity);
        }

        let renew_period = match first_validity {
            Some(validity) => validity / 3,
            None => roots_refresh,
        };

        let state = Arc::new(RwLock::new(SecretSnapshot { roots, certificates }));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(
            RenewLoop {
                session,
                state: state.clone(),
                identities,
                period: renew_period,
                tx,
                cancel: cancel.clone(),
            }
            .run(),
        );

        Ok((
            SecretRenewer {
                state,
                cancel,
                renew_period,
            },
            rx,
        ))
    }

    /// The current roots and certificates.
    pub async fn snapshot(&self) -> SecretSnapshot {
        self.state.read().await.clone()
    }

    /// The period between renewals.
    pub fn renew_period(&self) -> Duration {
        self.renew_period
    }

    /// Cancels the timer. The update channel closes once the timer task has
    /// wound down; a renewal already in flight completes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SecretRenewer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RenewLoop {
    session: Arc<dyn AuthoritySession>,
    state: Arc<RwLock<SecretSnapshot>>,
    identities: Vec<ClientIdentity>,
    period: Duration,
    tx: mpsc::Sender<SecretSnapshot>,
    cancel: CancellationToken,
}

impl RenewLoop {
    async fn run(mut self) {
        let mut delay = self.period;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.renew_all().await {
                Ok(()) => {
                    delay = self.period;
                    let snapshot = self.state.read().await.clone();
                    debug!(
                        certificates = snapshot.certificates.len(),
                        roots = snapshot.roots.len(),
                        "secrets renewed"
                    );
                    // non-blocking publish: a busy or absent consumer simply
                    // misses this tick
                    let _ = self.tx.try_send(snapshot);
                }
                Err(err) => {
                    delay = self.period / RETRY_DIVISOR;
                    warn!(error = %err, retry_in = ?delay, "secret renewal failed");
                }
            }
        }
    }

    async fn renew_all(&mut self) -> Result<(), CaError> {
        let mut state = self.state.write().await;

        let roots = self.session.roots().await?;
        self.session.set_roots(&roots)?;
        state.roots = roots;

        for i in 0..state.certificates.len() {
            let chain = self.session.renew(&self.identities[i]).await?;
            let name = state.certificates[i].name.clone();
            let key_pem = state.certificates[i].private_key_pem.clone();
            let (served, identity, _) = materialize(&name, chain, key_pem)?;
            state.certificates[i] = served;
            self.identities[i] = identity;
        }
        Ok(())
    }
}

/// Generates a key pair and a CSR for the subject. Returns both PEM.
fn new_csr(subject: &str) -> Result<(String, String), CaError> {
    let key = KeyPair::generate().map_err(|e| CaError::pki(format!("failed to generate key: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(subject.to_string()));
    params.distinguished_name = dn;
    params.subject_alt_names = vec![match subject.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(
            Ia5String::try_from(subject.to_string())
                .map_err(|e| CaError::pki(format!("invalid subject {subject}: {e}")))?,
        ),
    }];

    let csr = params
        .serialize_request(&key)
        .map_err(|e| CaError::pki(format!("failed to create CSR: {e}")))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| CaError::pki(format!("failed to serialize CSR: {e}")))?;
    Ok((csr_pem, key.serialize_pem()))
}

/// Turns a signed chain plus its key into the served form, the renewal
/// identity and the leaf validity.
fn materialize(
    name: &str,
    chain: CertificateChain,
    key_pem: String,
) -> Result<(ServedCertificate, ClientIdentity, Duration), CaError> {
    let leaf = chain.leaf()?;
    let (_, cert) = X509Certificate::from_der(leaf)
        .map_err(|e| CaError::pki(format!("failed to parse certificate: {e}")))?;
    let serial = hex::encode(cert.raw_serial());
    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    let validity = Duration::from_secs(not_after.saturating_sub(not_before).max(0) as u64);

    let identity = ClientIdentity {
        chain_pem: chain.to_pem(),
        key_pem: key_pem.clone(),
    };
    let served = ServedCertificate {
        name: name.to_string(),
        chain: chain.certificates,
        private_key_pem: key_pem,
        serial,
    };
    Ok((served, identity, validity))
}
