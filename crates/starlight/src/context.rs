//! Cancellation and progress plumbing shared by every pipeline stage.
//!
//! A job owns one `CancellationToken`. Each suspending step goes through
//! [`JobContext::guard`] (or [`JobContext::guard_or_abort`]), which races the
//! step against the token: whichever finishes first wins, and a cancellation
//! win surfaces as [`JobError::Canceled`]. Dropping the losing future is the
//! abort request; subprocesses are spawned with `kill_on_drop` and HTTP bodies
//! stop transferring once their response is dropped.
//!
//! Types:
//!
//! - `ProgressSink` receives `(increment, message)` pairs; increments are
//!   percentages of a nominal 100 and are never negative.
//! - `OutputLog` is the line-oriented output channel supplied by the caller.
//! - `JobContext` bundles the token with both sinks for one job.
use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::JobError;

pub trait ProgressSink: Sync {
    fn report(&self, increment: f64, message: Option<&str>);
}

pub trait OutputLog: Sync {
    fn log(&self, line: &str);
}

/// Discards progress updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _increment: f64, _message: Option<&str>) {}
}

/// Forwards output lines to `tracing` at INFO level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl OutputLog for TracingLog {
    fn log(&self, line: &str) {
        tracing::info!(target: "starlight::output", "{line}");
    }
}

pub struct JobContext<'a> {
    cancel: CancellationToken,
    progress: &'a dyn ProgressSink,
    log: &'a dyn OutputLog,
}

impl<'a> JobContext<'a> {
    pub fn new(
        cancel: CancellationToken,
        progress: &'a dyn ProgressSink,
        log: &'a dyn OutputLog,
    ) -> Self {
        Self {
            cancel,
            progress,
            log,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails fast when the job has already been canceled.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_canceled() {
            Err(JobError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Runs `step` until it completes or the job is canceled.
    pub async fn guard<T, F>(&self, step: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, JobError>>,
    {
        self.guard_or_abort(step, || {}).await
    }

    /// Like [`guard`](Self::guard), invoking `on_cancel` when cancellation wins
    /// so work the dropped future cannot stop by itself is told to stop.
    pub async fn guard_or_abort<T, F, A>(&self, step: F, on_cancel: A) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, JobError>>,
        A: FnOnce(),
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                on_cancel();
                tracing::debug!("job step interrupted by cancellation");
                Err(JobError::Canceled)
            }
            result = step => result,
        }
    }

    pub fn progress(&self, increment: f64, message: Option<&str>) {
        self.progress.report(increment.max(0.0), message);
    }

    pub fn log(&self, line: &str) {
        self.log.log(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(f64, Option<String>)>>);

    impl ProgressSink for Recorded {
        fn report(&self, increment: f64, message: Option<&str>) {
            self.0
                .lock()
                .unwrap()
                .push((increment, message.map(str::to_string)));
        }
    }

    #[tokio::test]
    async fn completed_step_passes_through() {
        let ctx = JobContext::new(CancellationToken::new(), &NoProgress, &TracingLog);
        let value = ctx.guard(async { Ok::<_, JobError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn pre_canceled_token_wins_the_race() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = JobContext::new(token, &NoProgress, &TracingLog);
        let aborted = AtomicBool::new(false);
        let err = ctx
            .guard_or_abort(async { Ok::<_, JobError>(()) }, || {
                aborted.store(true, Ordering::SeqCst)
            })
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_step() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(token.clone(), &NoProgress, &TracingLog);
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, JobError>(())
            })
            .await
            .unwrap_err();
        trigger.await.unwrap();
        assert!(err.is_canceled());
        assert!(ctx.checkpoint().is_err());
    }

    #[test]
    fn negative_increments_are_clamped() {
        let sink = Recorded::default();
        let ctx = JobContext::new(CancellationToken::new(), &sink, &TracingLog);
        ctx.progress(-3.0, Some("rewind"));
        ctx.progress(20.0, None);
        let seen = sink.0.lock().unwrap();
        assert_eq!(seen[0], (0.0, Some("rewind".to_string())));
        assert_eq!(seen[1], (20.0, None));
    }
}
