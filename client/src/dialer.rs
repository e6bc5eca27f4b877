//! Opening TLS connections to an enclave that are only handed out once
//! the enclave has proven what it is running.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use shared::{AttestationFailure, DocumentVerifier, MeasurementPolicy};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::cache::{AttestationCache, DocumentFetcher, HttpDocumentFetcher};
use crate::error::{Error, Result};
use crate::policy::PolicyProvider;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on the TLS handshake when the caller gave no deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on closing a rejected connection.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on the forced document reload after a failed check.
pub const RELOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// A TLS stream to an enclave that passed attestation.
pub type AttestedStream = TlsStream<TcpStream>;

/// Dials enclaves and checks every connection against the cached
/// attestation document and the current trust policy.
pub struct AttestedDialer<V, F: DocumentFetcher = HttpDocumentFetcher> {
    cache: Arc<AttestationCache<F>>,
    policy: Arc<PolicyProvider>,
    verifier: Arc<V>,
    tls: TlsConnector,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl<V, F: DocumentFetcher> Clone for AttestedDialer<V, F> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            policy: self.policy.clone(),
            verifier: self.verifier.clone(),
            tls: self.tls.clone(),
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

impl<V, F> AttestedDialer<V, F>
where
    V: DocumentVerifier + Send + Sync + 'static,
    F: DocumentFetcher,
{
    pub fn new(
        cache: Arc<AttestationCache<F>>,
        policy: Arc<PolicyProvider>,
        verifier: Arc<V>,
        tls: Arc<ClientConfig>,
    ) -> Self {
        Self {
            cache,
            policy,
            verifier,
            tls: TlsConnector::from(tls),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn cache(&self) -> &AttestationCache<F> {
        &self.cache
    }

    pub fn policy(&self) -> &PolicyProvider {
        &self.policy
    }

    /// Connect to `address` (`host:port`) and attest the peer.
    pub async fn dial(&self, network: &str, address: &str) -> Result<AttestedStream> {
        self.connect(network, address, None).await
    }

    /// Like [`Self::dial`], but the whole dial including any document
    /// reload must finish by `deadline`.
    pub async fn dial_with_deadline(
        &self,
        network: &str,
        address: &str,
        deadline: Instant,
    ) -> Result<AttestedStream> {
        tokio::time::timeout_at(deadline, self.connect(network, address, Some(deadline)))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Connect(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "deadline exceeded while dialing the enclave",
                )))
            })
    }

    async fn connect(
        &self,
        network: &str,
        address: &str,
        deadline: Option<Instant>,
    ) -> Result<AttestedStream> {
        if network != "tcp" {
            return Err(Error::UnsupportedNetwork(network.to_string()));
        }
        if self.policy.get().is_empty() {
            return Err(Error::NoPolicy);
        }
        let server_name = server_name(address)?;

        tracing::debug!("Connecting to {address}...");
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                Error::Connect(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("no connection after {:?}", self.connect_timeout),
                ))
            })?
            .map_err(Error::Connect)?;
        let handshake_deadline = match deadline {
            Some(deadline) => deadline.min(Instant::now() + self.handshake_timeout),
            None => Instant::now() + self.handshake_timeout,
        };
        let mut stream =
            tokio::time::timeout_at(handshake_deadline, self.tls.connect(server_name, tcp))
                .await
                .map_err(|_| {
                    Error::Tls(std::io::Error::new(
                        ErrorKind::TimedOut,
                        "TLS handshake with the enclave timed out",
                    ))
                })?
                .map_err(Error::Tls)?;

        let leaf = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());
        let result = match leaf {
            Some(leaf) => self.attest_peer(&leaf, deadline).await,
            None => Err(Error::NoPeerCertificate),
        };
        match result {
            Ok(()) => {
                tracing::debug!("Attested the enclave at {address}");
                Ok(stream)
            }
            Err(e) => {
                _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await;
                Err(e)
            }
        }
    }

    /// Decide whether a peer presenting `leaf_der` may be trusted. If
    /// the cached document might simply be outdated, it is reloaded
    /// once and checked again.
    pub async fn attest_peer(&self, leaf_der: &[u8], deadline: Option<Instant>) -> Result<()> {
        let policy = self.policy.get();
        if policy.is_empty() {
            return Err(Error::NoPolicy);
        }
        let doc = self.cache.get();
        let failure = match self.check(&doc, &policy, leaf_der) {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };
        if !failure.is_retryable() {
            tracing::error!("Rejecting enclave: {failure}");
            return Err(Error::AttestationFailed(failure));
        }

        tracing::warn!("Attestation check failed, reloading the document: {failure}");
        let reload_deadline = match deadline {
            Some(deadline) => deadline.min(Instant::now() + RELOAD_TIMEOUT),
            None => Instant::now() + RELOAD_TIMEOUT,
        };
        if let Err(e) = self.cache.reload_if_current(&doc, reload_deadline).await {
            tracing::error!("Rejecting enclave: {failure}; reloading the document failed: {e}");
            return Err(Error::AttestationFailed(failure));
        }
        self.check(&self.cache.get(), &policy, leaf_der).map_err(|failure| {
            tracing::error!("Rejecting enclave: {failure}");
            Error::AttestationFailed(failure)
        })
    }

    fn check(
        &self,
        doc: &[u8],
        policy: &MeasurementPolicy,
        leaf_der: &[u8],
    ) -> std::result::Result<(), AttestationFailure> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        shared::attest(self.verifier.as_ref(), doc, policy, leaf_der, now)
    }
}

/// The TLS server name for a `host:port` address. IPv6 hosts must be
/// bracketed.
pub fn server_name(address: &str) -> Result<ServerName<'static>> {
    let invalid = || Error::InvalidAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    port.parse::<u16>().map_err(|_| invalid())?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    ServerName::try_from(host.to_string()).map_err(|_| invalid())
}
