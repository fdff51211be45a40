//! Scoped suspend/resume of a cluster's task scheduling.
//!
//! A suspension is acquired as a [`SuspensionToken`] and released by an
//! explicit resume. [`SuspendResumeCoordinator::scoped`] pairs the two so
//! the resume runs whether the body succeeds, fails or panics.

use crate::cluster::ClusterSession;
use crate::control_plane::{ControlPlane, SuspendRequest};
use crate::poller::{PollOutcome, StatusPoller};
use crate::task::TaskHandle;
use futures::FutureExt;
use futures::future::join_all;
use mgmt_common::{ClusterId, MgmtError, TaskStatus};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a suspension is opened and closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspensionWindow {
    duration: Option<Duration>,
    stop_tasks: bool,
    on_resume_start_tasks: bool,
    start_tasks_on_exit: bool,
}

impl Default for SuspensionWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspensionWindow {
    /// Open-ended, stops running tasks, restarts them on exit.
    pub fn new() -> Self {
        Self {
            duration: None,
            stop_tasks: true,
            on_resume_start_tasks: false,
            start_tasks_on_exit: true,
        }
    }

    /// Resume automatically once `duration` has passed.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn stop_tasks(mut self, stop: bool) -> Self {
        self.stop_tasks = stop;
        self
    }

    /// Whether the automatic resume restarts the tasks it stopped.
    pub fn on_resume_start_tasks(mut self, start: bool) -> Self {
        self.on_resume_start_tasks = start;
        self
    }

    /// Whether the explicit resume at release restarts stopped tasks.
    pub fn start_tasks_on_exit(mut self, start: bool) -> Self {
        self.start_tasks_on_exit = start;
        self
    }

    pub fn get_duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn starts_tasks_on_exit(&self) -> bool {
        self.start_tasks_on_exit
    }

    pub fn request(&self) -> SuspendRequest {
        SuspendRequest {
            stop_tasks: self.stop_tasks,
            duration: self.duration,
            on_resume_start_tasks: self.on_resume_start_tasks,
        }
    }
}

/// Proof that a suspension is open. Hand it back to
/// [`SuspendResumeCoordinator::release`].
#[must_use = "a suspension stays open until the token is released"]
#[derive(Debug)]
pub struct SuspensionToken {
    cluster_id: ClusterId,
    window: SuspensionWindow,
    acquired_at: Instant,
    released: bool,
}

impl SuspensionToken {
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    pub fn window(&self) -> &SuspensionWindow {
        &self.window
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// When the control plane resumes on its own, if a duration was set.
    pub fn scheduled_resume_at(&self) -> Option<Instant> {
        self.window.duration.map(|d| self.acquired_at + d)
    }
}

impl Drop for SuspensionToken {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                cluster = %self.cluster_id,
                held = ?self.acquired_at.elapsed(),
                "suspension token dropped without release; cluster stays suspended"
            );
        }
    }
}

pub struct SuspendResumeCoordinator<'a, C: ?Sized = dyn ControlPlane> {
    session: &'a ClusterSession<C>,
    poller: StatusPoller,
}

impl<'a, C: ControlPlane + ?Sized> SuspendResumeCoordinator<'a, C> {
    pub fn new(session: &'a ClusterSession<C>) -> Self {
        Self {
            session,
            poller: session.poller().clone(),
        }
    }

    pub fn with_poller(mut self, poller: StatusPoller) -> Self {
        self.poller = poller;
        self
    }

    pub async fn acquire(&self, window: SuspensionWindow) -> Result<SuspensionToken, MgmtError> {
        self.session.suspend_with(&window).await?;
        Ok(SuspensionToken {
            cluster_id: self.session.id().clone(),
            window,
            acquired_at: Instant::now(),
            released: false,
        })
    }

    /// Resume with the token's exit policy.
    pub async fn release(&self, mut token: SuspensionToken) -> Result<(), MgmtError> {
        token.released = true;
        let start_tasks = token.window.start_tasks_on_exit;
        debug!(cluster = %token.cluster_id, held = ?token.acquired_at.elapsed(), start_tasks, "releasing suspension");
        self.session.resume(start_tasks).await
    }

    /// Run `body` inside a suspension.
    ///
    /// The release always runs. A release failure after a failing or
    /// panicking body is logged, and the body's outcome wins. A panic is
    /// re-raised after the release.
    pub async fn scoped<T, E, F, Fut>(&self, window: SuspensionWindow, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<MgmtError>,
    {
        let token = self.acquire(window).await?;
        let outcome = AssertUnwindSafe(body()).catch_unwind().await;
        let released = self.release(token).await;

        match outcome {
            Err(panic) => {
                if let Err(err) = released {
                    warn!(cluster = %self.session.id(), error = %err, "resume after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(err)) => {
                if let Err(release_err) = released {
                    warn!(cluster = %self.session.id(), error = %release_err, "resume after failed body failed");
                }
                Err(err)
            }
            Ok(Ok(value)) => {
                released?;
                Ok(value)
            }
        }
    }

    /// Wait concurrently until every task reports STOPPED.
    pub async fn await_stopped(&self, tasks: &[&TaskHandle<C>], timeout: Duration) -> Result<(), MgmtError> {
        let step = self.poller.interval();
        let results = join_all(
            tasks
                .iter()
                .map(|task| task.wait_for_status(&[TaskStatus::Stopped], step, timeout)),
        )
        .await;

        let mut not_stopped = Vec::new();
        for (task, result) in tasks.iter().zip(results) {
            if !result? {
                not_stopped.push(format!("{} ({})", task.id(), task.cached_status()));
            }
        }
        if not_stopped.is_empty() {
            info!(cluster = %self.session.id(), tasks = tasks.len(), "all tasks stopped");
            Ok(())
        } else {
            Err(MgmtError::NotStopped {
                tasks: not_stopped,
                waited: timeout,
            })
        }
    }

    /// Watch `task` for `hold` and fail if it is ever seen RUNNING.
    pub async fn hold_stopped(&self, task: &TaskHandle<C>, hold: Duration, step: Duration) -> Result<(), MgmtError> {
        let started = Instant::now();
        let what = format!("{} to stay stopped", task.id());
        let outcome = self
            .poller
            .with_interval(step)
            .poll(&what, hold, || task.status(), |s: &TaskStatus| *s == TaskStatus::Running)
            .await?;
        match outcome {
            PollOutcome::Completed(_) => Err(MgmtError::PrematureResume {
                task: task.id().clone(),
                after: started.elapsed(),
            }),
            PollOutcome::TimedOut { .. } => Ok(()),
        }
    }
}
