//! Waiting for externally managed objects to reach a desired state.
//!
//! The objects live behind an eventually consistent API, so a single read is not
//! enough: we poll the object at a fixed cadence and evaluate a set of conditions
//! against every snapshot we get back, until they all hold, the deadline passes,
//! or the caller cancels.
//!
//! Conditions distinguish "not yet" (`Ok(false)`) from "cannot tell" (`Err`).
//! The latter is never retried: a condition that can't make sense of the
//! observed state will not start making sense of it by looking again.
//!
//! All conditions of one wait are evaluated against the same snapshot.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

// Print a notice every this many unsuccessful attempts, so that a long wait
// doesn't look like a hang.
const NOTICE_EVERY_ATTEMPTS: u64 = 30;

/// Point-in-time read of a named object.
#[async_trait]
pub trait ObjectGetter<K>: Send + Sync {
    /// Returns `Ok(None)` if the object doesn't exist.
    async fn get_object(&self, name: &str) -> anyhow::Result<Option<K>>;

    /// Human readable kind of the objects, for log messages.
    fn kind(&self) -> &str {
        "object"
    }
}

/// A condition over one snapshot of an object. It may borrow from the caller.
pub type ConditionFn<'a, K> = dyn Fn(&K) -> anyhow::Result<bool> + Send + Sync + 'a;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidWaitOptions {
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("poll interval {poll_interval:?} exceeds the timeout {timeout:?}")]
    PollIntervalExceedsTimeout {
        poll_interval: Duration,
        timeout: Duration,
    },
}

/// How often to look, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForStateOptions {
    poll_interval: Duration,
    timeout: Duration,
}

impl WaitForStateOptions {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Result<Self, InvalidWaitOptions> {
        if poll_interval.is_zero() {
            return Err(InvalidWaitOptions::ZeroPollInterval);
        }
        if poll_interval > timeout {
            return Err(InvalidWaitOptions::PollIntervalExceedsTimeout {
                poll_interval,
                timeout,
            });
        }
        Ok(Self {
            poll_interval,
            timeout,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for WaitForStateOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError<K> {
    /// A condition could not evaluate the observed state.
    #[error("evaluating condition on {kind} {name:?}: {error:#}")]
    Evaluation {
        kind: String,
        name: String,
        error: anyhow::Error,
    },

    /// The conditions didn't hold before the timeout.
    #[error(
        "{kind} {name:?} did not reach the desired state within {timeout:?}{}",
        .last_fetch_error.as_ref().map(|e| format!(", last fetch error: {e}")).unwrap_or_default()
    )]
    DeadlineExceeded {
        kind: String,
        name: String,
        timeout: Duration,
        /// What the last successful fetch returned, `None` if the object didn't exist.
        last_observed: Option<Box<K>>,
        last_fetch_error: Option<String>,
    },

    /// The caller gave up on the wait.
    #[error("cancelled while waiting for {kind} {name:?}")]
    Cancelled {
        kind: String,
        name: String,
        last_observed: Option<Box<K>>,
    },
}

impl<K> WaitError<K> {
    /// Timeouts and cancellations both mean the wait ran out of time, as
    /// opposed to a condition failing.
    pub fn is_deadline(&self) -> bool {
        matches!(
            self,
            WaitError::DeadlineExceeded { .. } | WaitError::Cancelled { .. }
        )
    }

    pub fn last_observed(&self) -> Option<&K> {
        match self {
            WaitError::Evaluation { .. } => None,
            WaitError::DeadlineExceeded { last_observed, .. }
            | WaitError::Cancelled { last_observed, .. } => last_observed.as_deref(),
        }
    }
}

/// Waits until `condition` and all of `additional_conditions` hold on the same
/// snapshot of the object, and returns that snapshot.
///
/// A missing object does not satisfy the conditions; use
/// [`wait_for_object_deletion`] to wait for an object to go away.
pub async fn wait_for_object_state<K, G>(
    getter: &G,
    name: &str,
    options: &WaitForStateOptions,
    cancel: &CancellationToken,
    condition: &ConditionFn<'_, K>,
    additional_conditions: &[&ConditionFn<'_, K>],
) -> Result<K, WaitError<K>>
where
    G: ObjectGetter<K> + ?Sized,
    K: Clone + Send + Sync,
{
    poll_until(getter, name, options, cancel, |snapshot| {
        let Some(obj) = snapshot else {
            return Ok(None);
        };
        if !condition(obj)? {
            return Ok(None);
        }
        for additional in additional_conditions {
            if !additional(obj)? {
                return Ok(None);
            }
        }
        Ok(Some(obj.clone()))
    })
    .await
}

/// Waits until the object named `name` is gone.
///
/// If the name has been reused by a new object, `is_same_object` tells the
/// two apart (usually by comparing UIDs); a different object counts as the
/// original one being deleted.
pub async fn wait_for_object_deletion<K, G>(
    getter: &G,
    name: &str,
    options: &WaitForStateOptions,
    cancel: &CancellationToken,
    is_same_object: &(dyn Fn(&K) -> bool + Send + Sync),
) -> Result<(), WaitError<K>>
where
    G: ObjectGetter<K> + ?Sized,
    K: Clone + Send + Sync,
{
    poll_until(getter, name, options, cancel, |snapshot| {
        Ok(match snapshot {
            None => Some(()),
            Some(obj) if !is_same_object(obj) => Some(()),
            Some(_) => None,
        })
    })
    .await
}

/// Polls until `evaluate` produces a value. `Ok(None)` means "not yet".
async fn poll_until<K, T, G, F>(
    getter: &G,
    name: &str,
    options: &WaitForStateOptions,
    cancel: &CancellationToken,
    mut evaluate: F,
) -> Result<T, WaitError<K>>
where
    G: ObjectGetter<K> + ?Sized,
    K: Send + Sync,
    F: FnMut(Option<&K>) -> anyhow::Result<Option<T>>,
{
    let kind = getter.kind().to_string();
    let started_at = Instant::now();
    let deadline = started_at + options.timeout;
    // No fetch may outlive the budget of the whole wait.
    let fetch_deadline = deadline + options.poll_interval;

    let mut last_observed: Option<K> = None;
    let mut last_fetch_error: Option<anyhow::Error> = None;
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(WaitError::Cancelled {
                    kind,
                    name: name.to_string(),
                    last_observed: last_observed.map(Box::new),
                });
            }
            fetched = getter.get_object(name) => fetched,
            _ = tokio::time::sleep_until(fetch_deadline) => {
                warn!("fetching {kind} {name:?} (attempt {attempt}) did not complete in time");
                return Err(WaitError::DeadlineExceeded {
                    kind,
                    name: name.to_string(),
                    timeout: options.timeout,
                    last_observed: last_observed.map(Box::new),
                    last_fetch_error: Some(format!(
                        "fetch still pending after {:?}",
                        started_at.elapsed()
                    )),
                });
            }
        };

        match fetched {
            Ok(snapshot) => {
                last_fetch_error = None;
                let outcome =
                    evaluate(snapshot.as_ref()).map_err(|error| WaitError::Evaluation {
                        kind: kind.clone(),
                        name: name.to_string(),
                        error,
                    })?;
                if let Some(outcome) = outcome {
                    debug!(
                        "{kind} {name:?} reached the desired state after {attempt} attempts in {:?}",
                        started_at.elapsed()
                    );
                    return Ok(outcome);
                }
                last_observed = snapshot;
            }
            Err(e) => {
                // The API is allowed to be flaky, keep polling.
                warn!("failed to fetch {kind} {name:?} (attempt {attempt}): {e:#}");
                last_fetch_error = Some(e);
            }
        }

        if Instant::now() >= deadline {
            return Err(WaitError::DeadlineExceeded {
                kind,
                name: name.to_string(),
                timeout: options.timeout,
                last_observed: last_observed.map(Box::new),
                last_fetch_error: last_fetch_error.map(|e| format!("{e:#}")),
            });
        }

        if attempt % NOTICE_EVERY_ATTEMPTS == 0 {
            info!(
                "{kind} {name:?} has not reached the desired state yet after {:?}, continuing to wait",
                started_at.elapsed()
            );
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(WaitError::Cancelled {
                    kind,
                    name: name.to_string(),
                    last_observed: last_observed.map(Box::new),
                });
            }
            _ = tokio::time::sleep(options.poll_interval) => {}
        }
    }
}
