use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

pub mod cache;
pub mod config;
pub mod dialer;
pub mod error;
#[cfg(feature = "nitro")]
pub mod nitro;
pub mod policy;
pub mod poll;
pub mod tls;
pub mod transport;

pub use cache::{AttestationCache, DocumentFetcher, FetchError, HttpDocumentFetcher};
pub use config::Config;
pub use dialer::{AttestedDialer, AttestedStream};
pub use error::Error;
pub use policy::PolicyProvider;
pub use shared::{
    AttestationFailure, DocumentVerifier, MeasurementPolicy, MeasurementRegisterSet,
    VerifiedDocument,
};
pub use transport::{AttestedConnector, EnclaveClient};

/// Log to stdout, filtered by `RUST_LOG` (default `info`). Records
/// emitted through the `log` crate are forwarded as well.
pub fn init_logging() {
    SubscriberBuilder::default()
        .with_ansi(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
