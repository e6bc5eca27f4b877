//! Traits to abstract away particular attestation document formats

use alloc::vec::Vec;
use core::time::Duration;

use crate::measurement::RawRegisters;

/// What a document verifier extracts from an attestation document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifiedDocument {
    /// Whether the document's signature (and the certificate chain
    /// backing it) checked out.
    pub signature_valid: bool,
    /// The measurement registers asserted by the document.
    pub registers: RawRegisters,
    /// Arbitrary data embedded by the enclave. This is expected to be
    /// the DER encoded public key of the enclave's TLS certificate.
    pub user_data: Vec<u8>,
}

/// Logic for clients to check the signature of an attestation
/// document and extract the data it asserts.
pub trait DocumentVerifier {
    type Error: core::error::Error + core::fmt::Display;

    /// Parse and check an attestation document. `now` is the current
    /// time as a duration since the UNIX epoch and is used to check
    /// certificate validity.
    ///
    /// Structurally malformed documents are errors. A well formed
    /// document with a bad signature is reported through
    /// [`VerifiedDocument::signature_valid`].
    fn verify_document(&self, doc: &[u8], now: Duration) -> Result<VerifiedDocument, Self::Error>;
}
