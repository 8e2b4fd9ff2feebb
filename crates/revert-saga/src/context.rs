use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

/// Why a [`Context`] stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    /// A [`CancelHandle`] of the context or one of its ancestors fired.
    #[error("context cancelled")]
    Cancelled,
    /// The context's deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal and optional deadline threaded through a workflow run.
///
/// Contexts are cheap to clone. A derived context keeps every signal of its
/// parent, so cancelling a parent cancels all descendants while cancelling a
/// descendant leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct Context {
    signals: Vec<Arc<watch::Sender<bool>>>,
    deadline: Option<Instant>,
}

/// Fires the cancellation signal created by [`Context::with_cancel`].
///
/// Dropping the handle does not cancel anything.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancel the associated context and every context derived from it.
    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context with an additional cancellation signal.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (sender, _) = watch::channel(false);
        let signal = Arc::new(sender);

        let mut signals = self.signals.clone();
        signals.push(Arc::clone(&signal));

        (
            Self {
                signals,
                deadline: self.deadline,
            },
            CancelHandle { signal },
        )
    }

    /// Derive a context that expires at `deadline`, or at the parent's
    /// deadline if that comes first.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = self
            .deadline
            .map_or(deadline, |current| current.min(deadline));

        Self {
            signals: self.signals.clone(),
            deadline: Some(deadline),
        }
    }

    /// Derive a context that expires `timeout` from now.
    ///
    /// A timeout too large to represent leaves the deadline unchanged.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// Derive a context with every cancellation signal and the deadline removed.
    ///
    /// Compensations run on such a context so that undo work is not starved by
    /// the cancellation that triggered it. Callers may still layer a fresh
    /// signal on top with [`Context::with_cancel`].
    #[must_use]
    pub fn without_cancel(&self) -> Self {
        Self::background()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, or `None` while it is still live.
    #[must_use]
    pub fn err(&self) -> Option<CancelReason> {
        if self.signals.iter().any(|signal| *signal.borrow()) {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a [`Context::background`] context.
    pub async fn done(&self) -> CancelReason {
        if let Some(reason) = self.err() {
            return reason;
        }

        let cancelled = self.cancelled();
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                () = cancelled => CancelReason::Cancelled,
                () = sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                CancelReason::Cancelled
            }
        }
    }

    async fn cancelled(&self) {
        if self.signals.is_empty() {
            return pending().await;
        }

        let waiters = self.signals.iter().map(|signal| {
            let mut receiver = signal.subscribe();
            Box::pin(async move {
                // The sender lives as long as `self`, so an error here means
                // the signal can no longer fire.
                if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
                    pending::<()>().await;
                }
            })
        });
        select_all(waiters).await;
    }
}
