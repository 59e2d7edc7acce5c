//! # thread-affine
//!
//! Thread-affine dispatch onto host-owned named threads, with
//! continuations that keep the caller's ambient dispatch context intact.
//!
//! ## Features
//!
//! - **Thread identifiers**: thread, queue, task priority and thread priority packed into one host code
//! - **Dispatch tokens**: single-use handles the host invokes exactly once
//! - **Dispatch contexts**: non-blocking `post` and blocking `send` to a named thread
//! - **Continuation bridge**: a target-thread context stays ambient while a future runs,
//!   and the previous one comes back on success, failure or cancellation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use thread_affine::prelude::*;
//!
//! # fn main() -> thread_affine::Result<()> {
//! // Any HostDispatcher works; the loopback host owns its own threads
//! let host = LoopbackHost::start(LoopbackConfig::default())?;
//! let dispatcher = host.dispatcher();
//!
//! let game = dispatcher.context(ThreadId::GAME_THREAD);
//! game.post(|| println!("queued on the game thread"));
//! let answer = game.send(|| 6 * 7)?;
//! assert_eq!(answer, 42);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod thread_id;
pub mod registry;
pub mod host;
pub mod dispatcher;
pub mod context;
pub mod ambient;
pub mod bridge;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::thread_id::{compose, decompose, QueueIndex, TaskPriority, ThreadId, ThreadIndex, ThreadPriority};
    pub use crate::registry::{DispatchToken, HandleRegistry, GLOBAL_REGISTRY};
    pub use crate::host::{ExecutionContext, HostDispatcher, LoopbackConfig, LoopbackHost};
    pub use crate::dispatcher::{DispatchConfig, Dispatcher};
    pub use crate::context::ThreadAffineContext;
    pub use crate::ambient::AmbientGuard;
    pub use crate::bridge::{ContextBridge, WithThreadContext};
}

// Re-export the prelude at crate root for convenience
pub use prelude::*;
