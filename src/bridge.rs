//! Context-restoring continuation bridge
//!
//! [`ContextBridge`] wraps an in-flight future. Creating it installs a
//! [`ThreadAffineContext`] as the calling thread's ambient context right
//! away; when the wrapped future completes, the previous ambient context is
//! put back before the outcome is surfaced. The bridge never moves the
//! continuation to another thread: only the ambient pointer changes, and the
//! restore runs on whichever thread polls the completion.
//!
//! Outcomes:
//! - success yields `Ok(Some(value))`
//! - an error is propagated as is
//! - cancellation yields `Err(Error::CancellationObserved)` when
//!   `throw_on_cancel` is set, and `Ok(None)` otherwise

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use crate::ambient::{self, AmbientGuard};
use crate::context::ThreadAffineContext;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::thread_id::ThreadId;

/// Future that keeps a dispatch context ambient while the wrapped future runs
#[must_use = "futures do nothing unless polled"]
pub struct ContextBridge<F> {
    inner: Pin<Box<F>>,
    guard: Option<AmbientGuard>,
    context: Arc<ThreadAffineContext>,
    throw_on_cancel: bool,
}

impl<F> ContextBridge<F> {
    /// Install `context` as ambient on the calling thread and wrap `future`
    pub fn new(future: F, context: Arc<ThreadAffineContext>, throw_on_cancel: bool) -> Self {
        let guard = ambient::install(Arc::clone(&context));
        log::trace!("ambient context switched to {}", context.thread());

        Self {
            inner: Box::pin(future),
            guard: Some(guard),
            context,
            throw_on_cancel,
        }
    }

    /// The context installed for the duration of the operation
    pub fn context(&self) -> &Arc<ThreadAffineContext> {
        &self.context
    }

    /// Whether the previous ambient context is still waiting to be restored
    pub fn is_pending_restore(&self) -> bool {
        self.guard.is_some()
    }
}

impl<F, T, E> Future for ContextBridge<F>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
{
    type Output = Result<Option<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let outcome = match this.inner.as_mut().poll(cx) {
            Poll::Ready(outcome) => outcome,
            Poll::Pending => return Poll::Pending,
        };

        if let Some(guard) = this.guard.take() {
            guard.restore();
        }

        Poll::Ready(match outcome.map_err(Into::into) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_cancellation() => {
                if this.throw_on_cancel {
                    Err(Error::CancellationObserved)
                } else {
                    log::debug!("cancellation on {} swallowed", this.context.thread());
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        })
    }
}

/// Wrap any future in a [`ContextBridge`]
pub trait WithThreadContext: Future + Sized {
    /// Keep a context for `thread` ambient until this future completes
    fn with_thread_context(
        self,
        dispatcher: &Dispatcher,
        thread: ThreadId,
        throw_on_cancel: bool,
    ) -> ContextBridge<Self> {
        dispatcher.configure(self, thread, throw_on_cancel)
    }

    /// Same as [`with_thread_context`](Self::with_thread_context) using the dispatcher's defaults
    fn with_default_thread_context(self, dispatcher: &Dispatcher) -> ContextBridge<Self> {
        dispatcher.configure_default(self)
    }
}

impl<F: Future> WithThreadContext for F {}
