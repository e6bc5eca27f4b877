#![no_std]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod measurement;
pub mod tee;
pub mod verify;

pub use measurement::{MeasurementPolicy, MeasurementRegisterSet, RawRegisters};
pub use tee::{DocumentVerifier, VerifiedDocument};
pub use verify::{AttestationFailure, attest};
