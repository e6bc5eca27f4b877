//! A per-enclave cache of the attestation document, kept fresh by a
//! background task.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::poll::Poller;

/// Bound on the load performed when a cache is created and on each
/// background refresh.
pub const INITIAL_LOAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

const ATTESTATION_PATH: &str = "/.well-known/attestation";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request for the attestation document failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Attestation endpoint responded with status {0}")]
    Status(u16),
    #[error("Could not parse the attestation response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("The attestation document is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("The attestation endpoint returned an empty document")]
    Empty,
    #[error("Deadline exceeded while loading the attestation document")]
    DeadlineExceeded,
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FetchError> },
}

/// Retrieves the current attestation document of an enclave.
pub trait DocumentFetcher: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Fetches documents from `https://{host}/.well-known/attestation`.
pub struct HttpDocumentFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpDocumentFetcher {
    pub fn new(host: &str) -> Result<Self, FetchError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url: format!("https://{host}{ATTESTATION_PATH}"),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        decode_attestation_response(&response.bytes().await?)
    }
}

#[derive(Deserialize)]
struct AttestationResponse {
    attestation_doc: String,
}

/// Decode a `{"attestation_doc": "<base64>"}` response body.
pub fn decode_attestation_response(body: &[u8]) -> Result<Vec<u8>, FetchError> {
    let response: AttestationResponse = serde_json::from_slice(body)?;
    let doc = STANDARD.decode(response.attestation_doc)?;
    if doc.is_empty() {
        return Err(FetchError::Empty);
    }
    Ok(doc)
}

/// The delay before retry number `retry` (starting at 1).
fn backoff(retry: u32) -> Duration {
    RETRY_BASE_DELAY
        .saturating_mul(1 << retry.saturating_sub(1).min(16))
        .min(MAX_RETRY_DELAY)
}

struct CacheInner<F> {
    fetcher: F,
    doc: RwLock<Arc<[u8]>>,
    refresh: Mutex<()>,
}

impl<F: DocumentFetcher> CacheInner<F> {
    fn get(&self) -> Arc<[u8]> {
        self.doc.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Refreshes never overlap. With `seen` set, a document stored by
    /// another refresh while this one waited its turn is taken as is.
    async fn load_doc(
        &self,
        deadline: Instant,
        seen: Option<&Arc<[u8]>>,
    ) -> Result<(), FetchError> {
        let Ok(_refreshing) = tokio::time::timeout_at(deadline, self.refresh.lock()).await else {
            return Err(FetchError::DeadlineExceeded);
        };
        if seen.is_some_and(|seen| !Arc::ptr_eq(seen, &self.get())) {
            tracing::debug!("The attestation document was replaced while waiting, not fetching");
            return Ok(());
        }
        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout_at(deadline, self.fetcher.fetch())
                .await
                .map_err(|_| FetchError::DeadlineExceeded)?;
            let err = match result {
                Ok(doc) => {
                    tracing::info!("Loaded an attestation document of {} bytes", doc.len());
                    *self.doc.write().unwrap_or_else(PoisonError::into_inner) = doc.into();
                    return Ok(());
                }
                Err(err) => err,
            };
            if attempt >= MAX_ATTEMPTS {
                tracing::error!(
                    "Could not fetch the attestation document after {attempt} attempts, \
                     serving the previous one: {err}"
                );
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = backoff(attempt);
            if Instant::now() + delay > deadline {
                tracing::warn!("Fetching the attestation document failed: {err}");
                return Err(FetchError::DeadlineExceeded);
            }
            tracing::warn!(
                "Fetching the attestation document failed, retrying in {}s: {err}",
                delay.as_secs_f32()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Holds the last attestation document successfully fetched for one
/// enclave. Readers never wait on the network.
pub struct AttestationCache<F: DocumentFetcher = HttpDocumentFetcher> {
    inner: Arc<CacheInner<F>>,
    poller: Poller,
}

impl<F: DocumentFetcher> AttestationCache<F> {
    /// Load the document once and start refreshing it every
    /// `polling_interval`. If the first load fails the cache starts
    /// out empty.
    pub async fn new(fetcher: F, polling_interval: Duration) -> Self {
        let inner = Arc::new(CacheInner {
            fetcher,
            doc: RwLock::new(Arc::from(Vec::new())),
            refresh: Mutex::new(()),
        });
        if let Err(e) = inner.load_doc(Instant::now() + INITIAL_LOAD_TIMEOUT, None).await {
            tracing::warn!("Initial load of the attestation document failed: {e}");
        }
        let poller = Poller::spawn("attestation document", polling_interval, {
            let inner = inner.clone();
            move || {
                let inner = inner.clone();
                async move {
                    _ = inner.load_doc(Instant::now() + INITIAL_LOAD_TIMEOUT, None).await;
                }
            }
        });
        Self { inner, poller }
    }

    /// The cached document, empty if none was ever loaded.
    pub fn get(&self) -> Arc<[u8]> {
        self.inner.get()
    }

    /// Fetch a new document now and store it. Gives up at `deadline`.
    /// On failure the previous document is kept.
    pub async fn load_doc(&self, deadline: Instant) -> Result<(), FetchError> {
        self.inner.load_doc(deadline, None).await
    }

    /// Like [`Self::load_doc`], but only fetches if the cache still
    /// holds `seen`, a document previously returned by [`Self::get`].
    /// Callers that found the same document lacking share one fetch.
    pub async fn reload_if_current(
        &self,
        seen: &Arc<[u8]>,
        deadline: Instant,
    ) -> Result<(), FetchError> {
        self.inner.load_doc(deadline, Some(seen)).await
    }

    /// Stop the background refresh and wait for it to exit.
    pub async fn stop_polling(&self) {
        self.poller.stop().await;
    }
}
