//! Verifier for AWS Nitro Enclaves attestation documents.
//!
//! A document is a COSE_Sign1 structure whose CBOR payload lists the
//! enclave's PCRs, the certificate that signed it and the bundle of
//! certificates leading from the Nitro root to that certificate.

use std::collections::BTreeMap;
use std::time::Duration;

use ciborium::Value as CborValue;
use coset::{CborSerializable, CoseSign1, TaggedCborSerializable};
use p384::ecdsa::signature::Verifier;
use p384::ecdsa::{Signature, VerifyingKey};
use shared::{DocumentVerifier, RawRegisters, VerifiedDocument};
use thiserror::Error;
use x509_cert::Certificate;
use x509_cert::der::{Decode, DecodePem, Encode};

/// The only signature algorithm Nitro uses for certificates.
const ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";

#[derive(Error, Debug)]
pub enum NitroError {
    #[error("Document is not a COSE_Sign1 structure: {0}")]
    Cose(String),
    #[error("Could not decode the document payload: {0}")]
    Cbor(String),
    #[error("Document payload is missing field `{0}`")]
    MissingField(&'static str),
    #[error("Document field `{0}` has an unexpected type")]
    InvalidField(&'static str),
    #[error("Could not parse certificate: {0}")]
    Certificate(String),
}

/// The fields of a Nitro attestation document payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NitroDocument {
    pub module_id: String,
    pub timestamp: u64,
    pub digest: String,
    pub pcrs: BTreeMap<u64, Vec<u8>>,
    pub certificate: Vec<u8>,
    pub cabundle: Vec<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
}

impl NitroDocument {
    pub fn registers(&self) -> RawRegisters {
        let pcr = |ix: u64| self.pcrs.get(&ix).cloned().unwrap_or_default();
        RawRegisters {
            pcr0: pcr(0),
            pcr1: pcr(1),
            pcr2: pcr(2),
            pcr8: pcr(8),
        }
    }
}

fn decode_sign1(doc: &[u8]) -> Result<CoseSign1, NitroError> {
    CoseSign1::from_tagged_slice(doc)
        .or_else(|_| CoseSign1::from_slice(doc))
        .map_err(|e| NitroError::Cose(format!("{e:?}")))
}

/// Parse a document without checking any signature.
pub fn parse_document(doc: &[u8]) -> Result<NitroDocument, NitroError> {
    let sign1 = decode_sign1(doc)?;
    parse_payload(sign1.payload.as_deref().unwrap_or_default())
}

fn parse_payload(payload: &[u8]) -> Result<NitroDocument, NitroError> {
    let value: CborValue =
        ciborium::from_reader(payload).map_err(|e| NitroError::Cbor(e.to_string()))?;
    let CborValue::Map(entries) = value else {
        return Err(NitroError::Cbor("payload is not a map".to_string()));
    };
    let field = |key: &'static str| {
        entries
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
    };
    let required = |key: &'static str| field(key).ok_or(NitroError::MissingField(key));
    let bytes = |key: &'static str, v: &CborValue| {
        v.as_bytes().cloned().ok_or(NitroError::InvalidField(key))
    };
    let optional_bytes = |key: &'static str| field(key).map(|v| bytes(key, v)).transpose();

    let mut pcrs = BTreeMap::new();
    let pcr_entries = required("pcrs")?
        .as_map()
        .ok_or(NitroError::InvalidField("pcrs"))?;
    for (ix, value) in pcr_entries {
        let ix = ix
            .as_integer()
            .and_then(|ix| u64::try_from(ix).ok())
            .ok_or(NitroError::InvalidField("pcrs"))?;
        pcrs.insert(ix, bytes("pcrs", value)?);
    }
    let cabundle = required("cabundle")?
        .as_array()
        .ok_or(NitroError::InvalidField("cabundle"))?
        .iter()
        .map(|cert| bytes("cabundle", cert))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NitroDocument {
        module_id: required("module_id")?
            .as_text()
            .ok_or(NitroError::InvalidField("module_id"))?
            .to_string(),
        timestamp: required("timestamp")?
            .as_integer()
            .and_then(|t| u64::try_from(t).ok())
            .ok_or(NitroError::InvalidField("timestamp"))?,
        digest: required("digest")?
            .as_text()
            .ok_or(NitroError::InvalidField("digest"))?
            .to_string(),
        pcrs,
        certificate: bytes("certificate", required("certificate")?)?,
        cabundle,
        public_key: optional_bytes("public_key")?,
        user_data: optional_bytes("user_data")?,
        nonce: optional_bytes("nonce")?,
    })
}

fn parse_certificate(der: &[u8]) -> Result<Certificate, NitroError> {
    Certificate::from_der(der).map_err(|e| NitroError::Certificate(e.to_string()))
}

fn verifying_key(cert: &Certificate) -> Option<VerifyingKey> {
    let key = cert.tbs_certificate.subject_public_key_info.subject_public_key.as_bytes()?;
    VerifyingKey::from_sec1_bytes(key).ok()
}

fn is_valid_at(cert: &Certificate, now: Duration) -> bool {
    let validity = &cert.tbs_certificate.validity;
    let not_before = validity.not_before.to_unix_duration();
    let not_after = validity.not_after.to_unix_duration();
    not_before <= now && now <= not_after
}

/// Check that `issuer` signed `subject`.
fn is_signed_by(subject: &Certificate, issuer: &Certificate) -> bool {
    if subject.signature_algorithm.oid.to_string() != ECDSA_WITH_SHA384 {
        return false;
    }
    let Some(key) = verifying_key(issuer) else {
        return false;
    };
    let Some(signature) = subject
        .signature
        .as_bytes()
        .and_then(|sig| Signature::from_der(sig).ok())
    else {
        return false;
    };
    let Ok(tbs) = subject.tbs_certificate.to_der() else {
        return false;
    };
    key.verify(&tbs, &signature).is_ok()
}

/// Verifies documents against a fixed trusted root certificate.
#[derive(Debug, Clone)]
pub struct NitroVerifier {
    trusted_root: Vec<u8>,
}

impl NitroVerifier {
    /// Trust documents chaining to the DER encoded root certificate.
    pub fn new(trusted_root_der: Vec<u8>) -> Result<Self, NitroError> {
        parse_certificate(&trusted_root_der)?;
        Ok(Self {
            trusted_root: trusted_root_der,
        })
    }

    pub fn from_pem(pem: &str) -> Result<Self, NitroError> {
        let cert =
            Certificate::from_pem(pem).map_err(|e| NitroError::Certificate(e.to_string()))?;
        let der = cert
            .to_der()
            .map_err(|e| NitroError::Certificate(e.to_string()))?;
        Ok(Self { trusted_root: der })
    }

    /// The chain runs from the root at the start of the bundle to the
    /// signing certificate. Every certificate must be valid at `now`
    /// and signed by its predecessor, and the root must be ours.
    fn chain_is_trusted(&self, doc: &NitroDocument, now: Duration) -> Result<bool, NitroError> {
        if doc.cabundle.first() != Some(&self.trusted_root) {
            return Ok(false);
        }
        let chain = doc
            .cabundle
            .iter()
            .chain(std::iter::once(&doc.certificate))
            .map(|der| parse_certificate(der))
            .collect::<Result<Vec<_>, _>>()?;
        if !chain.iter().all(|cert| is_valid_at(cert, now)) {
            return Ok(false);
        }
        Ok(chain
            .windows(2)
            .all(|pair| is_signed_by(&pair[1], &pair[0])))
    }
}

impl DocumentVerifier for NitroVerifier {
    type Error = NitroError;

    fn verify_document(&self, doc: &[u8], now: Duration) -> Result<VerifiedDocument, NitroError> {
        let sign1 = decode_sign1(doc)?;
        let parsed = parse_payload(sign1.payload.as_deref().unwrap_or_default())?;
        let signer = parse_certificate(&parsed.certificate)?;

        let signature_ok = verifying_key(&signer).is_some_and(|key| {
            sign1
                .verify_signature(b"", |sig, data| {
                    let sig = Signature::from_slice(sig)?;
                    key.verify(data, &sig)
                })
                .is_ok()
        });
        let signature_valid = signature_ok && self.chain_is_trusted(&parsed, now)?;
        if !signature_valid {
            tracing::debug!("Nitro attestation document signature did not verify");
        }

        Ok(VerifiedDocument {
            signature_valid,
            registers: parsed.registers(),
            user_data: parsed.user_data.unwrap_or_default(),
        })
    }
}
