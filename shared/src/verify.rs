//! The checks that decide whether an attested TLS connection is
//! trusted. A connection is trusted only if the attestation document
//! is validly signed, its measurements satisfy the policy, and it
//! asserts the public key of the certificate presented in the TLS
//! handshake.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::time::Duration;

use thiserror::Error;
use x509_cert::Certificate;
use x509_cert::der::{Decode, Encode};

use crate::measurement::{MeasurementPolicy, MeasurementRegisterSet, RawRegisters};
use crate::tee::{DocumentVerifier, VerifiedDocument};

/// The check that caused a connection to be rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationFailure {
    #[error("No attestation document is available")]
    EmptyDocument,
    #[error("Could not parse attestation document: {0}")]
    Malformed(String),
    #[error("Unable to verify the attestation document signature")]
    UnverifiedSignature,
    #[error("Measurement registers do not match any trusted policy entry")]
    MeasurementMismatch,
    #[error("Attestation document does not embed the public key of the TLS certificate")]
    BindingMismatch,
    #[error("Could not parse the TLS certificate: {0}")]
    InvalidCertificate(String),
}

impl AttestationFailure {
    /// Whether fetching a fresh document could change the outcome.
    /// A forged signature or an unparsable peer certificate cannot be
    /// fixed by a redeployed enclave.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EmptyDocument
            | Self::Malformed(_)
            | Self::MeasurementMismatch
            | Self::BindingMismatch => true,
            Self::UnverifiedSignature | Self::InvalidCertificate(_) => false,
        }
    }
}

/// Check the signature of the document and return its contents. An
/// invalid signature is reported before anything else is looked at.
pub fn verify_document_signature<V: DocumentVerifier + ?Sized>(
    verifier: &V,
    doc: &[u8],
    now: Duration,
) -> Result<VerifiedDocument, AttestationFailure> {
    if doc.is_empty() {
        return Err(AttestationFailure::EmptyDocument);
    }
    let verified = verifier
        .verify_document(doc, now)
        .map_err(|e| AttestationFailure::Malformed(e.to_string()))?;
    if !verified.signature_valid {
        return Err(AttestationFailure::UnverifiedSignature);
    }
    Ok(verified)
}

/// True if at least one entry of the policy is compatible with the
/// registers of the document.
pub fn matches_policy(policy: &MeasurementPolicy, registers: &RawRegisters) -> bool {
    policy.matches(&MeasurementRegisterSet::from(registers))
}

/// Re-encode the public key of a DER certificate as a DER
/// `SubjectPublicKeyInfo`, the form enclaves embed in their documents.
pub fn certificate_public_key(cert_der: &[u8]) -> Result<Vec<u8>, AttestationFailure> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| AttestationFailure::InvalidCertificate(e.to_string()))?;
    cert.tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| AttestationFailure::InvalidCertificate(e.to_string()))
}

/// True if `user_data` is byte-for-byte the public key of the
/// certificate.
pub fn binds_to_certificate(
    user_data: &[u8],
    cert_der: &[u8],
) -> Result<bool, AttestationFailure> {
    Ok(certificate_public_key(cert_der)? == user_data)
}

/// Run every check against a document and the TLS leaf certificate,
/// in order: signature, measurements, public key binding.
pub fn attest<V: DocumentVerifier + ?Sized>(
    verifier: &V,
    doc: &[u8],
    policy: &MeasurementPolicy,
    cert_der: &[u8],
    now: Duration,
) -> Result<(), AttestationFailure> {
    let verified = verify_document_signature(verifier, doc, now)?;
    if !matches_policy(policy, &verified.registers) {
        return Err(AttestationFailure::MeasurementMismatch);
    }
    if !binds_to_certificate(&verified.user_data, cert_der)? {
        return Err(AttestationFailure::BindingMismatch);
    }
    Ok(())
}
