//! Ambient dispatch context
//!
//! Each thread carries an optional "current" [`ThreadAffineContext`], used by
//! code that dispatches without naming a target. Switching it is scoped: an
//! [`AmbientGuard`] remembers what it replaced and puts it back exactly once,
//! on whichever thread the guard is released.

use std::cell::RefCell;
use std::sync::Arc;
use crate::context::ThreadAffineContext;
use crate::error::{Error, Result};

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Arc<ThreadAffineContext>>> = const { RefCell::new(None) };
}

/// The ambient context of the calling thread, if any
pub fn current() -> Option<Arc<ThreadAffineContext>> {
    CURRENT_CONTEXT.with(|cell| cell.borrow().clone())
}

/// Replace the calling thread's ambient context, returning the previous one
pub fn replace(context: Option<Arc<ThreadAffineContext>>) -> Option<Arc<ThreadAffineContext>> {
    CURRENT_CONTEXT.with(|cell| cell.replace(context))
}

/// Make `context` ambient until the returned guard is released
pub fn install(context: Arc<ThreadAffineContext>) -> AmbientGuard {
    let previous = replace(Some(context));
    AmbientGuard {
        previous: Some(previous),
    }
}

/// Run `f` with `context` ambient, restoring the previous context afterwards
pub fn scope<F, R>(context: Arc<ThreadAffineContext>, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = install(context);
    f()
}

/// Post through the ambient context
pub fn post<F>(callback: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let context = current().ok_or(Error::NoAmbientContext)?;
    context.post(callback);
    Ok(())
}

/// Send through the ambient context
pub fn send<F, R>(callback: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let context = current().ok_or(Error::NoAmbientContext)?;
    context.send(callback)
}

/// Saved ambient context, restored when the guard is released or dropped
#[must_use = "the previous context is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct AmbientGuard {
    // Outer None once restored
    previous: Option<Option<Arc<ThreadAffineContext>>>,
}

impl AmbientGuard {
    /// The context that will be put back
    pub fn previous(&self) -> Option<&Arc<ThreadAffineContext>> {
        self.previous.as_ref().and_then(|previous| previous.as_ref())
    }

    /// Restore the previous context now
    pub fn restore(mut self) {
        self.restore_in_place();
    }

    fn restore_in_place(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Drop whatever was ambient only after the slot is updated
            let _replaced = replace(previous);
        }
    }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        self.restore_in_place();
    }
}
