//! Per-call deadline, cancellation and metadata.
//!
//! A [`CallContext`] is cheap to clone; every clone shares the same
//! cancellation signal, so `cancel()` on one is observed by all of them.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::Status;

/// Sentinel for "no deadline" in the wire `deadline_ns` field.
pub const NO_DEADLINE: u64 = u64::MAX;

/// Deadline, cancellation signal and call-scoped metadata for one call attempt.
#[derive(Clone, Debug)]
pub struct CallContext {
    deadline: Option<Instant>,
    /// Own signal last; ancestors first. Any of them set means cancelled.
    signals: Vec<Arc<watch::Sender<bool>>>,
    metadata: Vec<(String, String)>,
}

impl CallContext {
    /// A context with no deadline and no metadata.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            deadline: None,
            signals: vec![Arc::new(tx)],
            metadata: Vec::new(),
        }
    }

    /// Bound the call by `timeout` from now. Keeps an existing tighter deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Bound the call by an absolute deadline. Keeps an existing tighter deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Derive a context that is cancelled along with `self`, but whose own
    /// `cancel()` leaves `self` untouched.
    pub fn child(&self) -> Self {
        let (tx, _) = watch::channel(false);
        let mut signals = self.signals.clone();
        signals.push(Arc::new(tx));
        Self {
            deadline: self.deadline,
            signals,
            metadata: self.metadata.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Cancel this context and every child derived from it. Idempotent.
    pub fn cancel(&self) {
        if let Some(own) = self.signals.last() {
            own.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(|signal| *signal.borrow())
    }

    /// The terminal status this context forces, if it has already fired.
    ///
    /// Cancellation wins over an elapsed deadline when both hold.
    pub fn err(&self) -> Option<Status> {
        if self.is_cancelled() {
            return Some(cancelled_status());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(deadline_status()),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline elapses.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancelled() => cancelled_status(),
                    _ = tokio::time::sleep_until(deadline) => deadline_status(),
                }
            }
            None => {
                self.cancelled().await;
                cancelled_status()
            }
        }
    }

    /// Drive `fut` unless the context fires first.
    ///
    /// When the context fires, `fut` is dropped and nothing it would have
    /// produced reaches the caller.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Status> {
        if let Some(status) = self.err() {
            return Err(status);
        }
        tokio::select! {
            biased;
            status = self.done() => Err(status),
            output = fut => Ok(output),
        }
    }

    /// Absolute deadline as wall-clock unix nanoseconds for the wire.
    pub fn deadline_unix_nanos(&self) -> u64 {
        let Some(remaining) = self.remaining() else {
            return NO_DEADLINE;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let nanos = (now + remaining).as_nanos();
        // Never collide with the sentinel.
        u64::try_from(nanos).unwrap_or(NO_DEADLINE - 1).min(NO_DEADLINE - 1)
    }

    /// Rebuild the local deadline from a wire `deadline_ns` value.
    pub fn with_unix_deadline(self, deadline_ns: u64) -> Self {
        if deadline_ns == NO_DEADLINE {
            return self;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let remaining = Duration::from_nanos(deadline_ns).saturating_sub(now);
        self.with_deadline(Instant::now() + remaining)
    }

    async fn cancelled(&self) {
        let waits = self.signals.iter().map(|signal| {
            let mut rx = signal.subscribe();
            Box::pin(async move {
                // The sender lives in `self.signals`, so this cannot close early.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waits).await;
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

fn cancelled_status() -> Status {
    Status::cancelled("call cancelled")
}

fn deadline_status() -> Status {
    Status::deadline_exceeded("deadline exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[tokio::test]
    async fn fresh_context_has_not_fired() {
        let ctx = CallContext::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert_eq!(ctx.deadline_unix_nanos(), NO_DEADLINE);
    }

    #[tokio::test]
    async fn cancel_is_visible_to_clones() {
        let ctx = CallContext::new();
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(clone.err().map(|s| s.code()), Some(Code::Cancelled));
        assert_eq!(clone.done().await.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child_but_not_back() {
        let parent = CallContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other_child = parent.child();
        parent.cancel();
        assert!(other_child.is_cancelled());
        assert_eq!(other_child.done().await.code(), Code::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_done() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let status = ctx.done().await;
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn tighter_deadline_wins() {
        let ctx = CallContext::new()
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(10));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn run_drops_slow_future_at_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(10));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                42
            })
            .await;
        assert_eq!(result.unwrap_err().code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn run_passes_through_fast_future() {
        let ctx = CallContext::new();
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn run_refuses_already_cancelled_context() {
        let ctx = CallContext::new();
        ctx.cancel();
        let result = ctx.run(async { 1 }).await;
        assert_eq!(result.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn wire_deadline_roundtrip_is_close() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(30));
        let rebuilt = CallContext::new().with_unix_deadline(ctx.deadline_unix_nanos());
        let remaining = rebuilt.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(29));
    }

    #[test]
    fn metadata_lookup() {
        let ctx = CallContext::new()
            .with_metadata("trace-id", "abc")
            .with_metadata("user", "juan");
        assert_eq!(ctx.metadata_value("user"), Some("juan"));
        assert_eq!(ctx.metadata_value("missing"), None);
        assert_eq!(ctx.metadata().len(), 2);
    }
}
