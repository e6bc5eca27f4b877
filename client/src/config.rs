//! Module for handling the backing config file of the client. It
//! names the enclave to talk to, how often its attestation document
//! and trust policy are refreshed and which measurements are trusted.

use std::fmt::Formatter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use shared::MeasurementPolicy;

use crate::error::{Error, Result};

const ATTESTED_DIR: &str = ".attested";
const CONFIG_FILE: &str = "config.toml";
const ATTESTATION_POLLING_INTERVAL: u64 = 2700;
const POLICY_POLLING_INTERVAL: u64 = 300;
const CONNECT_TIMEOUT: u64 = 5;

const ENV_ENCLAVE_HOST: &str = "ATTESTED_ENCLAVE_HOST";
const ENV_DOC_POLL_SECS: &str = "ATTESTED_DOC_POLL_SECS";
const ENV_POLICY_POLL_SECS: &str = "ATTESTED_POLICY_POLL_SECS";
const ENV_CONNECT_TIMEOUT_SECS: &str = "ATTESTED_CONNECT_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host (and optionally port) of the enclave
    pub enclave_host: String,
    /// How often the attestation document is refreshed
    #[serde(serialize_with = "serialize_secs")]
    #[serde(deserialize_with = "deserialize_secs")]
    pub attestation_polling_interval: Duration,
    /// How often a polling trust policy is refreshed
    #[serde(serialize_with = "serialize_secs")]
    #[serde(deserialize_with = "deserialize_secs")]
    pub policy_polling_interval: Duration,
    #[serde(serialize_with = "serialize_secs")]
    #[serde(deserialize_with = "deserialize_secs")]
    pub connect_timeout: Duration,
    /// If false, the enclave's certificate chain is not checked
    /// against the webpki roots and attestation is the only anchor.
    pub verify_certificate_chain: bool,
    /// PEM file holding the root certificate attestation documents
    /// must chain to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_root: Option<PathBuf>,
    /// Trusted measurements
    pub policy: MeasurementPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enclave_host: String::new(),
            attestation_polling_interval: Duration::from_secs(ATTESTATION_POLLING_INTERVAL),
            policy_polling_interval: Duration::from_secs(POLICY_POLLING_INTERVAL),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT),
            verify_certificate_chain: true,
            trusted_root: None,
            policy: MeasurementPolicy::default(),
        }
    }
}

impl Config {
    /// Load the config from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        toml::from_str(&std::fs::read_to_string(path)?)
            .map_err(|e| Error::Config(format!("Could not parse {}: {e}", path.display())))
    }

    /// Parse a config from the contents of a TOML file
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load the config from `path` or else from the default location,
    /// apply overrides from the environment and check the result.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => attested_dir()?.join(CONFIG_FILE),
        };
        let config = if path.exists() {
            Self::load(&path)?
        } else {
            tracing::warn!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        let config = config.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Replace fields by the values `lookup` returns for the
    /// `ATTESTED_*` variables.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(host) = lookup(ENV_ENCLAVE_HOST) {
            self.enclave_host = host;
        }
        let secs = |key: &str| -> Result<Option<Duration>> {
            lookup(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|e| Error::Config(format!("{key}={v:?}: {e}")))
                })
                .transpose()
        };
        if let Some(interval) = secs(ENV_DOC_POLL_SECS)? {
            self.attestation_polling_interval = interval;
        }
        if let Some(interval) = secs(ENV_POLICY_POLL_SECS)? {
            self.policy_polling_interval = interval;
        }
        if let Some(timeout) = secs(ENV_CONNECT_TIMEOUT_SECS)? {
            self.connect_timeout = timeout;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enclave_host.trim().is_empty() {
            return Err(Error::Config("enclave_host is not set".to_string()));
        }
        if self.attestation_polling_interval.is_zero() || self.policy_polling_interval.is_zero() {
            return Err(Error::Config("polling intervals must be positive".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Save the config at the specified path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// The directory holding the client's files
pub fn attested_dir() -> Result<PathBuf> {
    home::home_dir()
        .map(|home| home.join(ATTESTED_DIR))
        .ok_or_else(|| Error::Config("Could not determine the home directory".to_string()))
}

fn serialize_secs<S>(duration: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u64(duration.as_secs())
}

fn deserialize_secs<'de, D>(des: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct SecsVisitor;
    impl Visitor<'_> for SecsVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("A non-negative number of seconds")
        }

        fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
        where
            E: DeError,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
        where
            E: DeError,
        {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("Negative duration: {v}")))
        }
    }
    des.deserialize_u64(SecsVisitor)
}
