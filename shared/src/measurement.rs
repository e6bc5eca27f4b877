//! Measurement registers reported by an enclave and the policies a
//! client holds them against.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::slice;

use serde::{Deserialize, Serialize};

/// The raw register values parsed out of an attestation document.
/// Only the registers a client checks are kept.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawRegisters {
    pub pcr0: Vec<u8>,
    pub pcr1: Vec<u8>,
    pub pcr2: Vec<u8>,
    pub pcr8: Vec<u8>,
}

/// Hex digests of the four measurement registers a client checks.
///
/// An empty field means "don't care": it places no constraint on
/// that register.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RegisterFields")]
pub struct MeasurementRegisterSet {
    pcr0: String,
    pcr1: String,
    pcr2: String,
    pcr8: String,
}

/// Field layout used when reading a register set from config or JSON.
#[derive(Default, Deserialize)]
#[serde(default)]
struct RegisterFields {
    pcr0: String,
    pcr1: String,
    pcr2: String,
    pcr8: String,
}

impl From<RegisterFields> for MeasurementRegisterSet {
    fn from(f: RegisterFields) -> Self {
        Self::new(f.pcr0, f.pcr1, f.pcr2, f.pcr8)
    }
}

/// Two register values conflict only if both are specified and differ.
fn conflicts(expected: &str, actual: &str) -> bool {
    !expected.is_empty() && !actual.is_empty() && expected != actual
}

fn normalize(digest: impl AsRef<str>) -> String {
    digest.as_ref().trim().to_ascii_lowercase()
}

impl MeasurementRegisterSet {
    /// Create a register set. Digests are normalized to lowercase hex.
    pub fn new(
        pcr0: impl AsRef<str>,
        pcr1: impl AsRef<str>,
        pcr2: impl AsRef<str>,
        pcr8: impl AsRef<str>,
    ) -> Self {
        Self {
            pcr0: normalize(pcr0),
            pcr1: normalize(pcr1),
            pcr2: normalize(pcr2),
            pcr8: normalize(pcr8),
        }
    }

    pub fn pcr0(&self) -> &str {
        &self.pcr0
    }

    pub fn pcr1(&self) -> &str {
        &self.pcr1
    }

    pub fn pcr2(&self) -> &str {
        &self.pcr2
    }

    pub fn pcr8(&self) -> &str {
        &self.pcr8
    }

    /// True if no register is specified. Such a set would match any
    /// document and is never valid policy input.
    pub fn is_empty(&self) -> bool {
        self.pcr0.is_empty() && self.pcr1.is_empty() && self.pcr2.is_empty() && self.pcr8.is_empty()
    }

    /// Check that no register specified on both sides differs.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        !conflicts(&self.pcr0, &other.pcr0)
            && !conflicts(&self.pcr1, &other.pcr1)
            && !conflicts(&self.pcr2, &other.pcr2)
            && !conflicts(&self.pcr8, &other.pcr8)
    }
}

impl From<&RawRegisters> for MeasurementRegisterSet {
    fn from(raw: &RawRegisters) -> Self {
        Self {
            pcr0: hex::encode(&raw.pcr0),
            pcr1: hex::encode(&raw.pcr1),
            pcr2: hex::encode(&raw.pcr2),
            pcr8: hex::encode(&raw.pcr8),
        }
    }
}

impl core::fmt::Display for MeasurementRegisterSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let show = |s: &str| if s.is_empty() { "*".to_string() } else { s.to_string() };
        write!(
            f,
            "PCR0={} PCR1={} PCR2={} PCR8={}",
            show(&self.pcr0),
            show(&self.pcr1),
            show(&self.pcr2),
            show(&self.pcr8)
        )
    }
}

/// A list of acceptable register sets. A document satisfies the
/// policy if it is compatible with any one of them.
///
/// All-empty sets are dropped on construction, so an empty policy
/// means no trust has been configured.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<MeasurementRegisterSet>", into = "Vec<MeasurementRegisterSet>")]
pub struct MeasurementPolicy(Vec<MeasurementRegisterSet>);

impl MeasurementPolicy {
    pub fn new(sets: impl IntoIterator<Item = MeasurementRegisterSet>) -> Self {
        Self(sets.into_iter().filter(|s| !s.is_empty()).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> slice::Iter<'_, MeasurementRegisterSet> {
        self.0.iter()
    }

    /// Check whether any entry of the policy accepts `registers`.
    pub fn matches(&self, registers: &MeasurementRegisterSet) -> bool {
        self.0.iter().any(|expected| expected.is_compatible_with(registers))
    }
}

impl From<Vec<MeasurementRegisterSet>> for MeasurementPolicy {
    fn from(sets: Vec<MeasurementRegisterSet>) -> Self {
        Self::new(sets)
    }
}

impl From<MeasurementPolicy> for Vec<MeasurementRegisterSet> {
    fn from(policy: MeasurementPolicy) -> Self {
        policy.0
    }
}

impl<'a> IntoIterator for &'a MeasurementPolicy {
    type Item = &'a MeasurementRegisterSet;
    type IntoIter = slice::Iter<'a, MeasurementRegisterSet>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
