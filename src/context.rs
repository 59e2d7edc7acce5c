//! Thread-affine dispatch context
//!
//! A [`ThreadAffineContext`] is bound to one target thread and to the host
//! execution context that was current when it was created. `post` queues a
//! callback and returns at once; `send` waits for the callback to finish on
//! the target thread, or runs it inline when the caller is already there.

use std::fmt;
use crossbeam::channel::{bounded, RecvTimeoutError};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::host::ExecutionContext;
use crate::registry::Callback;
use crate::thread_id::ThreadId;

/// Dispatch context bound to a single host thread
pub struct ThreadAffineContext {
    thread: ThreadId,
    execution_context: ExecutionContext,
    dispatcher: Dispatcher,
}

impl ThreadAffineContext {
    /// Bind a context to `thread`.
    ///
    /// The host's execution context is read here once and never again.
    pub fn new(dispatcher: Dispatcher, thread: ThreadId) -> Self {
        let execution_context = dispatcher.host().current_execution_context();
        Self::with_execution_context(dispatcher, thread, execution_context)
    }

    /// Bind a context to `thread` in an explicit execution context
    pub fn with_execution_context(dispatcher: Dispatcher, thread: ThreadId, execution_context: ExecutionContext) -> Self {
        Self {
            thread,
            execution_context,
            dispatcher,
        }
    }

    /// Target thread
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Host execution context captured at construction
    pub fn execution_context(&self) -> ExecutionContext {
        self.execution_context
    }

    /// Dispatcher this context delivers through
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Thread identifier of the caller, as reported by the host
    pub fn current_thread(&self) -> Result<ThreadId> {
        self.dispatcher.current_thread()
    }

    /// Whether the caller is already running on the target thread
    pub fn is_current(&self) -> bool {
        match self.current_thread() {
            Ok(current) => self.thread.same_named_thread(current),
            Err(e) => {
                log::debug!("host reported an undecodable current thread: {}", e);
                false
            }
        }
    }

    /// Queue `callback` on the target thread without waiting.
    ///
    /// The callback runs at most once. A host refusal is logged and dropped;
    /// use [`send`](Self::send) when delivery failures must be observed.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = self.dispatch(Box::new(callback)) {
            log::warn!("post to {} dropped: {}", self.thread, e);
        }
    }

    /// Run `callback` on the target thread and wait for its result.
    ///
    /// Runs inline when already on the target thread. Blocks forever if the
    /// target thread is itself waiting on the caller.
    pub fn send<F, R>(&self, callback: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            log::trace!("send to {} running inline", self.thread);
            return Ok(callback());
        }

        let (done_tx, done_rx) = bounded::<R>(1);

        // done_tx is dropped on every exit path of the wrapper, so a panic or
        // a cancelled token wakes the caller instead of stranding it
        self.dispatch(Box::new(move || {
            let value = callback();
            let _ = done_tx.send(value);
        }))?;

        match self.dispatcher.config().send_timeout {
            Some(timeout) => done_rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout,
                RecvTimeoutError::Disconnected => self.abandoned(),
            }),
            None => done_rx.recv().map_err(|_| self.abandoned()),
        }
    }

    fn dispatch(&self, callback: Callback) -> Result<()> {
        self.dispatcher.dispatch(self.execution_context, self.thread, callback)
    }

    fn abandoned(&self) -> Error {
        Error::DispatchFailure {
            reason: format!("callback on {} was dropped before it completed", self.thread),
        }
    }
}

impl fmt::Debug for ThreadAffineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadAffineContext")
            .field("thread", &self.thread)
            .field("execution_context", &self.execution_context)
            .finish()
    }
}
