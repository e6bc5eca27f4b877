//! Error type for the attested client library

use shared::AttestationFailure;
use thiserror::Error;

use crate::cache::FetchError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No trust policy configured")]
    NoPolicy,
    #[error("Unsupported network {0:?}, only \"tcp\" can be attested")]
    UnsupportedNetwork(String),
    #[error("Invalid enclave address {0:?}")]
    InvalidAddress(String),
    #[error("Could not connect to the enclave: {0}")]
    Connect(std::io::Error),
    #[error("TLS handshake with the enclave failed: {0}")]
    Tls(std::io::Error),
    #[error("The enclave did not present a TLS certificate")]
    NoPeerCertificate,
    #[error("Fetching the attestation document failed: {0}")]
    Fetch(#[from] FetchError),
    /// The detail is deliberately kept out of `Display`. Use
    /// [`Error::attestation_failure`] to inspect it locally.
    #[error("attestation failed")]
    AttestationFailed(AttestationFailure),
    #[error("HTTP request to the enclave failed: {0}")]
    Http(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The check that rejected the enclave, if this is an attestation
    /// failure.
    pub fn attestation_failure(&self) -> Option<&AttestationFailure> {
        match self {
            Self::AttestationFailed(failure) => Some(failure),
            _ => None,
        }
    }
}
