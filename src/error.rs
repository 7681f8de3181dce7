//! Error types for the SDS server

use thiserror::Error;

use crate::ca::CaError;

/// Main error type for server setup and serving
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate authority interaction failed
    #[error(transparent)]
    Ca(#[from] CaError),

    /// Local PKI material could not be read or parsed
    #[error("PKI error: {0}")]
    Pki(String),

    /// gRPC transport failure (listener, TLS config, serving)
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }
}
