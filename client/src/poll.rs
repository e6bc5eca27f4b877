//! Background jobs that run on a fixed interval until they are
//! stopped.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Periods shorter than this are rounded up.
const MIN_PERIOD: Duration = Duration::from_millis(1);

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns a spawned polling task. Dropping the poller also ends the
/// task, but only [`Poller::stop`] waits for it to finish.
pub struct Poller {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl Poller {
    /// Spawn a task calling `tick` once per `period`. The first call
    /// happens one period from now. If a tick runs late the missed
    /// calls are skipped rather than queued.
    pub fn spawn<T, Fut>(name: &'static str, period: Duration, mut tick: T) -> Self
    where
        T: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::task::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    // also fires if the sender was dropped
                    _ = stopped.changed() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!("The {name} poller has stopped");
        });
        Self {
            name,
            running: Mutex::new(Some(Running { stop, handle })),
        }
    }

    /// Signal the task to stop and wait until it has. A tick that is
    /// in progress runs to completion first. Calling this more than
    /// once is a no-op.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { stop, handle }) = running {
            tracing::debug!("Stopping the {} poller...", self.name);
            _ = stop.send(true);
            if let Err(e) = handle.await {
                tracing::error!("The {} poller panicked: {e}", self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
