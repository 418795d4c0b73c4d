//! Purpose: Bound every blocking relay step by a deadline and a shared cancel signal.
//! Exports: `Timeouts`, `StepGuard`.
//! Role: Used by the materializer and publisher around connect/query/declare/publish.
//! Invariants: A raised cancel signal wins over a pending step result.
//! Invariants: Timeout and cancellation are reported as their own error kinds.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeouts {
    pub connect: Duration,
    pub query: Duration,
    pub publish: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            query: DEFAULT_QUERY_TIMEOUT,
            publish: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct StepGuard {
    timeouts: Timeouts,
    cancel: CancellationToken,
}

impl StepGuard {
    pub fn new(timeouts: Timeouts, cancel: CancellationToken) -> Self {
        Self { timeouts, cancel }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs one step; the step's own errors pass through tagged with `stage`.
    pub async fn run<T, F>(&self, stage: &'static str, limit: Duration, step: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::new(ErrorKind::Cancelled)
                .with_message("relay cancelled")
                .with_stage(stage)),
            outcome = tokio::time::timeout(limit, step) => match outcome {
                Ok(result) => result.map_err(|err| err.with_stage(stage)),
                Err(_) => Err(Error::new(ErrorKind::Timeout)
                    .with_message(format!("{stage} did not finish within {}ms", limit.as_millis()))
                    .with_stage(stage)
                    .with_hint("Raise the matching *_timeout_ms setting if the step is legitimately slow.")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{StepGuard, Timeouts};
    use crate::core::error::{Error, ErrorKind};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn passes_step_result_through() {
        let guard = StepGuard::default();
        let value = guard
            .run("query", Duration::from_secs(1), async { Ok::<_, Error>(7) })
            .await
            .expect("ok");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn step_errors_carry_the_stage() {
        let guard = StepGuard::default();
        let err = guard
            .run("declare", Duration::from_secs(1), async {
                Err::<(), _>(Error::new(ErrorKind::Delivery))
            })
            .await
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Delivery);
        assert_eq!(err.stage(), Some("declare"));
    }

    #[tokio::test]
    async fn slow_step_times_out() {
        let guard = StepGuard::default();
        let err = guard
            .run("query", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>(())
            })
            .await
            .expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.stage(), Some("query"));
    }

    #[tokio::test]
    async fn cancelled_token_wins_over_ready_step() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let guard = StepGuard::new(Timeouts::default(), cancel);
        let err = guard
            .run("connect", Duration::from_secs(1), async { Ok::<_, Error>(()) })
            .await
            .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(guard.is_cancelled());
    }
}
