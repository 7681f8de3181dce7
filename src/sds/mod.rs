//! Secret discovery service
//!
//! The xDS state-of-the-world implementation for the secret resource type:
//! response assembly, per-stream discovery protocol, certificate renewal and
//! peer authorization.

use std::time::Duration;

pub mod renewer;
pub mod response;
pub mod service;
mod stream;
pub mod validator;

pub use renewer::{SecretRenewer, SecretSnapshot, ServedCertificate};
pub use service::Service;

/// Resource name answered with the trust bundle instead of a certificate.
pub const VALIDATION_CONTEXT_NAME: &str = "trusted_ca";

/// Alternative resource name for the trust bundle.
pub const VALIDATION_CONTEXT_ALT_NAME: &str = "validation_context";

/// Type URL of the secret resource for the negotiated xDS version.
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Control-plane identifier stamped on every response.
pub const IDENTIFIER: &str = concat!("Warden SDS/", env!("CARGO_PKG_VERSION"));

/// How often roots are refreshed when no certificate drives the renewal
/// period.
pub const DEFAULT_ROOTS_REFRESH: Duration = Duration::from_secs(8 * 60 * 60);

/// Returns true if the name is one of the reserved validation-context
/// resource names. Matching is case-sensitive.
pub fn is_validation_context(name: &str) -> bool {
    name == VALIDATION_CONTEXT_NAME || name == VALIDATION_CONTEXT_ALT_NAME
}
