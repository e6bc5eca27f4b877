//! Where the trusted measurements come from. A policy is either fixed
//! at construction or re-fetched periodically from a caller supplied
//! source.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use eyre::WrapErr;
use shared::{MeasurementPolicy, MeasurementRegisterSet};

use crate::poll::Poller;

/// Bound on a single call to the policy source.
pub const POLICY_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Caller supplied function returning the current list of trusted
/// register sets. It may block; it is run on the blocking thread pool.
pub trait PolicySource:
    Fn() -> eyre::Result<Vec<MeasurementRegisterSet>> + Send + Sync + 'static
{
}

impl<T> PolicySource for T where
    T: Fn() -> eyre::Result<Vec<MeasurementRegisterSet>> + Send + Sync + 'static
{
}

/// Provides the measurement policy connections are checked against.
pub enum PolicyProvider {
    Static(Arc<MeasurementPolicy>),
    Polling(PollingPolicy),
}

pub struct PollingPolicy {
    current: Arc<RwLock<Arc<MeasurementPolicy>>>,
    poller: Poller,
}

impl PolicyProvider {
    /// A provider returning the same policy for its whole lifetime.
    /// Register sets without any specified register are dropped.
    pub fn fixed(sets: impl IntoIterator<Item = MeasurementRegisterSet>) -> Self {
        Self::Static(Arc::new(MeasurementPolicy::new(sets)))
    }

    /// A provider that calls `fetch` now and then once every
    /// `interval`. If the first call fails the policy starts out empty;
    /// later failures keep the previous policy. A call that takes longer
    /// than [`POLICY_FETCH_TIMEOUT`] counts as failed.
    pub async fn polling<S: PolicySource>(interval: Duration, fetch: S) -> Self {
        Self::polling_with_timeout(interval, POLICY_FETCH_TIMEOUT, fetch).await
    }

    /// Like [`Self::polling`] with a custom bound on each call.
    pub async fn polling_with_timeout<S: PolicySource>(
        interval: Duration,
        fetch_timeout: Duration,
        fetch: S,
    ) -> Self {
        let fetch = Arc::new(fetch);
        let initial = fetch_policy(fetch.clone(), fetch_timeout).await.unwrap_or_else(|e| {
            tracing::warn!("Could not fetch the trust policy, starting out empty: {e:#}");
            MeasurementPolicy::default()
        });
        tracing::info!("Loaded a trust policy with {} entries", initial.len());
        let current = Arc::new(RwLock::new(Arc::new(initial)));

        let poller = Poller::spawn("trust policy", interval, {
            let current = current.clone();
            move || {
                let fetch = fetch.clone();
                let current = current.clone();
                async move {
                    match fetch_policy(fetch, fetch_timeout).await {
                        Ok(policy) => {
                            tracing::debug!("Refreshed the trust policy: {} entries", policy.len());
                            *current.write().unwrap_or_else(PoisonError::into_inner) =
                                Arc::new(policy);
                        }
                        Err(e) => {
                            tracing::warn!("Could not refresh the trust policy: {e:#}");
                        }
                    }
                }
            }
        });
        Self::Polling(PollingPolicy { current, poller })
    }

    /// The current policy. Never waits on I/O.
    pub fn get(&self) -> Arc<MeasurementPolicy> {
        match self {
            Self::Static(policy) => policy.clone(),
            Self::Polling(polling) => polling
                .current
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Stop refreshing the policy and wait for the background task to
    /// exit. The last policy stays available through [`Self::get`].
    pub async fn stop_polling(&self) {
        if let Self::Polling(polling) = self {
            polling.poller.stop().await;
        }
    }
}

/// A source that overruns `timeout` is abandoned; its blocking call
/// finishes in the background and the result is dropped.
async fn fetch_policy<S: PolicySource>(
    fetch: Arc<S>,
    timeout: Duration,
) -> eyre::Result<MeasurementPolicy> {
    let call = tokio::task::spawn_blocking(move || (*fetch)());
    let sets = tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| eyre::eyre!("The trust policy source did not answer within {timeout:?}"))?
        .wrap_err("The trust policy source panicked")??;
    Ok(MeasurementPolicy::new(sets))
}
