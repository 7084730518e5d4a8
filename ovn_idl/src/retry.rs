//! Explicit retry policies.
//!
//! A `RetryPolicy` carries the backoff shape and the total time budget; the
//! caller supplies the retryable-error predicate at the call site.

use std::{future::Future, time::Duration};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IdlError, IdlResult};

/// Exponential backoff settings.
///
/// `max_elapsed_ms = None` retries forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    #[serde(default)]
    pub randomization_factor: f64,
    #[serde(default)]
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bootstrap()
    }
}

impl RetryPolicy {
    /// Schema retrieval during startup: 1s doubling up to 180s, never gives up.
    pub fn bootstrap() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 180_000,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_ms: None,
        }
    }

    /// Waiting for a row to show up in the mirror: 1s doubling, 10s in total.
    pub fn row_visibility() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 10_000,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_ms: Some(10_000),
        }
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed_ms = max_elapsed.map(millis);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval_ms = millis(interval);
        self
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_interval_ms == 0 {
            return Err("initial_interval_ms must be greater than 0".to_string());
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err("max_interval_ms must not be smaller than initial_interval_ms".to_string());
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0".to_string());
        }
        if !(0.0..1.0).contains(&self.randomization_factor) {
            return Err("randomization_factor must be in [0.0, 1.0)".to_string());
        }
        Ok(())
    }

    /// Fresh backoff state; the elapsed-time clock starts here.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(self.max_elapsed())
            .build()
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// or the budget runs out. The last error is returned in the latter two
    /// cases.
    pub async fn retry<T, F, Fut, P>(&self, what: &str, retryable: P, op: F) -> IdlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IdlResult<T>>,
        P: Fn(&IdlError) -> bool,
    {
        self.retry_notify(retryable, op, |e: &IdlError, delay: Duration| {
            debug!("{} failed: {}. Retrying in {:?}", what, e, delay);
        })
        .await
    }

    /// Like `retry`, with `notify` called before every wait.
    pub async fn retry_notify<T, F, Fut, P, N>(
        &self,
        retryable: P,
        mut op: F,
        mut notify: N,
    ) -> IdlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IdlResult<T>>,
        P: Fn(&IdlError) -> bool,
        N: FnMut(&IdlError, Duration),
    {
        let retryable = &retryable;
        backoff::future::retry_notify(
            self.backoff(),
            || {
                let fut = op();
                async move {
                    fut.await.map_err(|e| {
                        if retryable(&e) {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: IdlError, delay: Duration| notify(&e, delay),
        )
        .await
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
