//! Bounded status polling.
//!
//! Every wait in the harness reduces to [`StatusPoller::poll`]: fetch at a
//! fixed interval until a predicate holds or the deadline passes. The last
//! fetch happens at the deadline. A single fetch may run past the deadline
//! by at most one interval, so a call returns no later than `timeout` plus
//! one interval even when the control plane stops answering.
//!
//! Fetch failures are classified with [`MgmtError::is_transport`]. Transport
//! failures are retried silently until `max_consecutive_failures` is
//! exceeded, then the error surfaces unmodified. Anything else (a
//! rejection, a missing task) surfaces at once. A failed fetch never counts
//! as a terminal observation.

use mgmt_common::{MgmtError, PollSettings, TaskStatus};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout as time_limit};
use tracing::{debug, trace, warn};

/// Result of a poll that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    /// The predicate held for this value.
    Completed(T),
    /// Deadline passed. Carries the last successfully fetched value, if any.
    TimedOut { last: Option<T> },
}

impl<T> PollOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The completed value or the last one seen before the deadline.
    pub fn into_last(self) -> Option<T> {
        match self {
            Self::Completed(v) => Some(v),
            Self::TimedOut { last } => last,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusPoller {
    interval: Duration,
    max_consecutive_failures: u32,
}

impl StatusPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_consecutive_failures: 5,
        }
    }

    pub fn from_settings(settings: &PollSettings) -> Self {
        Self {
            interval: settings.step,
            max_consecutive_failures: settings.max_consecutive_failures,
        }
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Same failure bound, different step.
    pub fn with_interval(&self, interval: Duration) -> Self {
        Self {
            interval,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fetch until `done` holds for a value or `timeout` elapses.
    pub async fn poll<T, F, Fut, P>(
        &self,
        what: &str,
        timeout: Duration,
        mut fetch: F,
        mut done: P,
    ) -> Result<PollOutcome<T>, MgmtError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MgmtError>>,
        P: FnMut(&T) -> bool,
    {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last = None;
        let mut failures = 0u32;
        let mut fetches = 0u32;

        loop {
            fetches += 1;
            let budget = deadline.saturating_duration_since(Instant::now()) + self.interval;
            let Ok(fetched) = time_limit(budget, fetch()).await else {
                warn!(what, fetches, ?budget, "fetch still pending at the deadline");
                return Ok(PollOutcome::TimedOut { last });
            };
            match fetched {
                Ok(value) => {
                    failures = 0;
                    if done(&value) {
                        debug!(what, fetches, elapsed = ?started.elapsed(), "poll condition met");
                        return Ok(PollOutcome::Completed(value));
                    }
                    last = Some(value);
                }
                Err(err) if err.is_transport() => {
                    failures += 1;
                    if failures > self.max_consecutive_failures {
                        warn!(what, failures, error = %err, "giving up after consecutive fetch failures");
                        return Err(err);
                    }
                    debug!(what, failures, error = %err, "fetch failed, will retry");
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(what, fetches, ?timeout, "poll timed out");
                return Ok(PollOutcome::TimedOut { last });
            }
            let pause = self.interval.min(deadline - now);
            trace!(what, ?pause, "sleeping before next fetch");
            sleep(pause).await;
        }
    }

    /// Poll a status until it is terminal.
    pub async fn poll_status<F, Fut>(
        &self,
        what: &str,
        timeout: Duration,
        fetch: F,
    ) -> Result<PollOutcome<TaskStatus>, MgmtError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TaskStatus, MgmtError>>,
    {
        self.poll(what, timeout, fetch, |s: &TaskStatus| s.is_terminal()).await
    }

    /// Whether any of `statuses` is observed before the deadline.
    ///
    /// Returns `false` on timeout, and early when a terminal status outside
    /// the set shows up, since terminal statuses never change again.
    pub async fn wait_for_any<F, Fut>(
        &self,
        statuses: &[TaskStatus],
        timeout: Duration,
        fetch: F,
    ) -> Result<bool, MgmtError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TaskStatus, MgmtError>>,
    {
        let what = format!("status in {statuses:?}");
        let outcome = self
            .poll(&what, timeout, fetch, |s: &TaskStatus| {
                statuses.contains(s) || s.is_terminal()
            })
            .await?;
        Ok(match outcome {
            PollOutcome::Completed(status) => statuses.contains(&status),
            PollOutcome::TimedOut { .. } => false,
        })
    }

    /// Block until the fetched percentage reaches `threshold`.
    ///
    /// Unlike the status waits this is fatal on timeout: callers use it to
    /// pace follow-up actions and cannot continue without it.
    pub async fn wait_for_percentage<F, Fut>(
        &self,
        threshold: f64,
        timeout: Duration,
        fetch: F,
    ) -> Result<f64, MgmtError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<f64, MgmtError>>,
    {
        let what = format!("progress >= {threshold}%");
        match self.poll(&what, timeout, fetch, |pct: &f64| *pct >= threshold).await? {
            PollOutcome::Completed(pct) => Ok(pct),
            PollOutcome::TimedOut { last } => Err(MgmtError::PollTimeout {
                what,
                waited: timeout,
                last: last.map_or_else(|| "nothing".to_string(), |p| format!("{p:.1}%")),
            }),
        }
    }
}

impl Default for StatusPoller {
    fn default() -> Self {
        Self::from_settings(&PollSettings::default())
    }
}
