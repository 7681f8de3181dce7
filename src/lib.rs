//! Warden SDS - a secret discovery service for data-plane proxies
//!
//! Serves TLS certificates and root-of-trust bundles over the xDS secret
//! discovery protocol. A proxy subscribes to logical secret names on a
//! long-lived gRPC stream; the service mints certificates for those names
//! from an upstream certificate authority using a provisioner credential,
//! pushes an initial snapshot, and keeps pushing fresh material as
//! certificates approach expiry.
//!
//! # Modules
//!
//! - [`sds`] - the discovery protocol: streaming state machine, renewal,
//!   response assembly and peer authorization
//! - [`ca`] - the upstream certificate authority: provisioner tokens, the
//!   HTTPS client and an embedded mini-CA
//! - [`config`] - persisted JSON configuration
//! - [`logging`] - structured, request-correlated logging
//! - [`proto`] - the Envoy xDS v3 wire types
//! - [`error`] - crate error types

#![warn(missing_docs)]

pub mod ca;
pub mod config;
pub mod error;
pub mod logging;
pub mod proto;
pub mod sds;

pub use config::Config;
pub use error::Error;
pub use sds::Service;

/// Result type alias using the crate error type
pub type Result<T> = std::result::Result<T, Error>;
