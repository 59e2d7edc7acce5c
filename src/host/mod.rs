//! Host dispatcher interface
//!
//! The embedding host owns the named threads. This crate only asks it to
//! run tokens on a thread, to say which thread the caller is on, and to
//! name the current world/session.

pub mod loopback;

use std::fmt;
use crate::error::Result;
use crate::registry::DispatchToken;

pub use loopback::{LoopbackConfig, LoopbackHost};

/// Opaque handle naming a host world or session
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExecutionContext(pub usize);

impl ExecutionContext {
    /// The null context, used by hosts with no notion of worlds
    pub const NONE: ExecutionContext = ExecutionContext(0);

    /// Get the raw handle
    pub fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutionContext({:#x})", self.0)
    }
}

/// Interface every embedding host provides
pub trait HostDispatcher: Send + Sync {
    /// Queue `token` for execution on the thread described by `thread_code`.
    ///
    /// May be called from any thread and must not block on the target. The
    /// host later hands the token to
    /// [`HandleRegistry::invoke_and_release`](crate::registry::HandleRegistry::invoke_and_release)
    /// exactly once on that thread. Returning `Err` means the host did not
    /// take ownership of the token and never will invoke it. If the host
    /// already invoked or cancelled the token before failing, the dispatch
    /// counts as delivered and the error is only logged.
    fn run_on_thread(&self, context: ExecutionContext, thread_code: i32, token: DispatchToken) -> Result<()>;

    /// Thread code of the calling thread
    fn current_named_thread(&self) -> i32;

    /// World or session the caller is running in
    fn current_execution_context(&self) -> ExecutionContext;
}
