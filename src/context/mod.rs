//! Cancellable contexts handed to pipeline stages.
//!
//! A [`Context`] carries a cancellation flag and the reason it was set.
//! Cancellation is idempotent: only the first reason is kept, and it
//! propagates to every context derived with [`Context::child`]. Watchdog
//! tasks await [`Context::cancelled`] to learn about it.

use crate::errors::Error;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

/// A cancellable context passed to every stage `start`.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    children: RwLock<Vec<Weak<Inner>>>,
    notify: Notify,
}

impl Context {
    /// Creates a fresh, uncancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a context that is cancelled whenever `self` is.
    ///
    /// Cancelling the child does not affect the parent.
    #[must_use]
    pub fn child(&self) -> Context {
        let child = Context::new();
        self.inner
            .children
            .write()
            .push(Arc::downgrade(&child.inner));
        if self.is_cancelled() {
            child.cancel(self.reason().unwrap_or_default());
        }
        child
    }

    /// Requests cancellation. The first reason wins; later calls are
    /// ignored.
    pub fn cancel(&self, reason: impl Into<String>) {
        Inner::cancel(&self.inner, reason.into());
    }

    /// Cancels this context after `timeout` elapses. This is how callers
    /// attach a deadline to a pipeline run.
    pub fn cancel_after(&self, timeout: Duration, reason: impl Into<String>) {
        let ctx = self.clone();
        let reason = reason.into();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            ctx.cancel(reason);
        });
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// The cancellation cause as an error, if cancelled.
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        if self.is_cancelled() {
            Some(Error::Cancelled(
                self.reason().unwrap_or_else(|| "context cancelled".into()),
            ))
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Inner {
    fn cancel(this: &Arc<Inner>, reason: String) {
        if this
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *this.reason.write() = Some(reason.clone());
            this.notify.notify_waiters();

            let children = std::mem::take(&mut *this.children.write());
            for child in children {
                if let Some(child) = child.upgrade() {
                    Inner::cancel(&child, reason.clone());
                }
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_starts_uncancelled() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.reason().is_none());
        assert!(ctx.err().is_none());
    }

    #[test]
    fn test_cancel_keeps_first_reason() {
        let ctx = Context::new();
        ctx.cancel("first");
        ctx.cancel("second");

        assert!(ctx.is_cancelled());
        assert_eq!(ctx.reason(), Some("first".to_string()));
        assert!(matches!(ctx.err(), Some(Error::Cancelled(r)) if r == "first"));
    }

    #[test]
    fn test_child_observes_parent_cancellation() {
        let parent = Context::new();
        let child = parent.child();

        parent.cancel("shutting down");
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some("shutting down".to_string()));
    }

    #[test]
    fn test_child_cancellation_does_not_reach_parent() {
        let parent = Context::new();
        let child = parent.child();

        child.cancel("local");
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_is_cancelled() {
        let parent = Context::new();
        parent.cancel("done");

        let child = parent.child();
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some("done".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let ctx = Context::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        ctx.cancel("go");
        handle.await.expect("waiter should resolve");
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_immediately_when_already_cancelled() {
        let ctx = Context::new();
        ctx.cancel("done");
        ctx.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fires_on_deadline() {
        let ctx = Context::new();
        ctx.cancel_after(Duration::from_millis(50), "deadline exceeded");

        ctx.cancelled().await;
        assert_eq!(ctx.reason(), Some("deadline exceeded".to_string()));
    }
}
