//! Peer authorization
//!
//! TCP streams are mutually authenticated at the transport; this module
//! checks the presented leaf against the configured identity (common name)
//! and fingerprint. UNIX domain socket streams carry no TLS state and are
//! trusted by the listener's filesystem permissions instead.

use std::net::SocketAddr;

use tonic::{Request, Status};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::ca::fingerprint;

/// Transport identity of the connected peer
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    /// Remote socket address, when the transport exposes one
    pub addr: Option<SocketAddr>,
    /// Peer certificate chain in DER, leaf first; `None` without TLS state
    pub certificates: Option<Vec<Vec<u8>>>,
}

impl PeerIdentity {
    /// Captures the peer identity from an incoming request.
    pub fn from_request<T>(request: &Request<T>) -> PeerIdentity {
        let certificates = request
            .peer_certs()
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect());
        PeerIdentity {
            addr: request.remote_addr(),
            certificates,
        }
    }

    /// Common name of the peer's leaf certificate.
    pub fn common_name(&self) -> Option<String> {
        let leaf = self.certificates.as_ref()?.first()?;
        common_name(leaf)
    }
}

/// Validates stream peers against the configured authorization values
#[derive(Debug, Clone, Default)]
pub struct PeerValidator {
    /// Required leaf common name, compared case-insensitively
    pub authorized_identity: Option<String>,
    /// Required leaf SHA-256 fingerprint, lowercase hex, compared
    /// case-insensitively
    pub authorized_fingerprint: Option<String>,
    /// Whether the listener is TCP; UDS peers skip validation
    pub is_tcp: bool,
}

impl PeerValidator {
    /// Checks the peer. `Internal` when the TLS state is missing entirely,
    /// `PermissionDenied` for a missing certificate or a mismatch.
    pub fn validate(&self, peer: &PeerIdentity) -> Result<(), Status> {
        if !self.is_tcp {
            return Ok(());
        }

        let certs = peer.certificates.as_ref().ok_or_else(|| {
            Status::internal("failed to obtain TLS connection state for request")
        })?;
        let leaf = certs
            .first()
            .ok_or_else(|| Status::permission_denied("missing peer certificate"))?;

        if let Some(identity) = &self.authorized_identity {
            let cn = common_name(leaf).unwrap_or_default();
            if !cn.eq_ignore_ascii_case(identity) {
                return Err(Status::permission_denied(format!(
                    "certificate common name {cn} is not authorized"
                )));
            }
        }

        if let Some(authorized) = &self.authorized_fingerprint {
            let fp = fingerprint(leaf);
            if !fp.eq_ignore_ascii_case(authorized) {
                return Err(Status::permission_denied(format!(
                    "certificate fingerprint {fp} is not authorized"
                )));
            }
        }

        Ok(())
    }
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}
