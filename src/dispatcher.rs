//! Dispatcher facade
//!
//! A [`Dispatcher`] bundles the host, the handle registry the host invokes
//! tokens through, and the dispatch configuration. It hands out
//! [`ThreadAffineContext`]s and builds context-restoring continuations.
//!
//! Every token a dispatcher allocates is recorded in a ledger shared by its
//! clones and the contexts it created, so [`Dispatcher::shutdown`] releases
//! only its own tokens even on a registry shared with other hosts.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use crate::bridge::ContextBridge;
use crate::context::ThreadAffineContext;
use crate::error::{Error, Result};
use crate::host::{ExecutionContext, HostDispatcher};
use crate::registry::{Callback, DispatchToken, HandleRegistry, GLOBAL_REGISTRY};
use crate::thread_id::ThreadId;

/// Dispatch configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Thread targeted by [`Dispatcher::configure_default`]
    pub default_thread: ThreadId,
    /// Whether [`Dispatcher::configure_default`] surfaces cancellation as an error
    pub throw_on_cancel: bool,
    /// Upper bound on how long `send` waits for the target thread (None = forever)
    pub send_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_thread: ThreadId::GAME_THREAD,
            throw_on_cancel: false,
            send_timeout: None,
        }
    }
}

/// Tokens allocated through one dispatcher and not yet run or released
#[derive(Default)]
struct TokenLedger {
    tokens: Mutex<HashSet<DispatchToken>>,
}

/// Ledger entry owned by a registered callback; leaves the ledger when the
/// callback runs or is dropped unrun
struct LedgerEntry {
    ledger: Arc<TokenLedger>,
    token: DispatchToken,
}

impl Drop for LedgerEntry {
    fn drop(&mut self) {
        self.ledger.tokens.lock().remove(&self.token);
    }
}

/// Entry point for dispatching onto host-owned threads
#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn HostDispatcher>,
    registry: Arc<HandleRegistry>,
    config: DispatchConfig,
    ledger: Arc<TokenLedger>,
}

impl Dispatcher {
    /// Create a dispatcher that registers callbacks in [`GLOBAL_REGISTRY`]
    pub fn new(host: Arc<dyn HostDispatcher>) -> Self {
        Self::with_config(host, DispatchConfig::default())
    }

    /// Create a dispatcher on the global registry with custom configuration
    pub fn with_config(host: Arc<dyn HostDispatcher>, config: DispatchConfig) -> Self {
        Self::with_registry(host, Arc::clone(&GLOBAL_REGISTRY), config)
    }

    /// Create a dispatcher with its own registry.
    ///
    /// The host must invoke tokens through this same registry.
    pub fn with_registry(
        host: Arc<dyn HostDispatcher>,
        registry: Arc<HandleRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            host,
            registry,
            config,
            ledger: Arc::new(TokenLedger::default()),
        }
    }

    /// The host this dispatcher delivers to
    pub fn host(&self) -> &Arc<dyn HostDispatcher> {
        &self.host
    }

    /// The registry tokens are allocated in
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Dispatch configuration
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Bind a dispatch context to `thread` in the host's current execution context
    pub fn context(&self, thread: ThreadId) -> Arc<ThreadAffineContext> {
        Arc::new(ThreadAffineContext::new(self.clone(), thread))
    }

    /// Bind a dispatch context to `thread` in an explicit execution context
    pub fn context_in(&self, thread: ThreadId, execution_context: ExecutionContext) -> Arc<ThreadAffineContext> {
        Arc::new(ThreadAffineContext::with_execution_context(self.clone(), thread, execution_context))
    }

    /// Queue `callback` on `thread` within `execution_context`.
    ///
    /// One-shot form of [`ThreadAffineContext::post`] for callers that name
    /// the world explicitly. Unlike `post`, a host refusal is returned.
    pub fn run_on_thread<F>(&self, execution_context: ExecutionContext, thread: ThreadId, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch(execution_context, thread, Box::new(callback))
    }

    pub(crate) fn dispatch(&self, execution_context: ExecutionContext, thread: ThreadId, callback: Callback) -> Result<()> {
        let token = self.allocate(callback);

        let delivered = self.host.run_on_thread(execution_context, thread.code(), token);
        let e = match delivered {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        // A refused token is still ours to release
        if self.registry.cancel_many([token]) == 0 {
            // Already run or released by the host, so the failure came after delivery
            log::warn!("host reported failure for {:?} on {} after taking it: {}", token, thread, e);
            return Ok(());
        }
        Err(match e {
            Error::DispatchFailure { .. } => e,
            other => Error::DispatchFailure { reason: other.to_string() },
        })
    }

    fn allocate(&self, callback: Callback) -> DispatchToken {
        let ledger = Arc::clone(&self.ledger);
        self.registry.allocate_with(move |token| {
            ledger.tokens.lock().insert(token);
            let entry = LedgerEntry { ledger, token };
            let tracked: Callback = Box::new(move || {
                drop(entry);
                callback();
            });
            tracked
        })
    }

    /// Number of this dispatcher's tokens still waiting for delivery
    pub fn outstanding(&self) -> usize {
        self.ledger.tokens.lock().len()
    }

    /// Thread identifier of the caller, as reported by the host
    pub fn current_thread(&self) -> Result<ThreadId> {
        ThreadId::from_code(self.host.current_named_thread())
    }

    /// Make a context for `thread` ambient until `future` completes
    pub fn configure<F>(&self, future: F, thread: ThreadId, throw_on_cancel: bool) -> ContextBridge<F> {
        ContextBridge::new(future, self.context(thread), throw_on_cancel)
    }

    /// [`configure`](Self::configure) with the configured default thread and cancel policy
    pub fn configure_default<F>(&self, future: F) -> ContextBridge<F> {
        self.configure(future, self.config.default_thread, self.config.throw_on_cancel)
    }

    /// Release every token this dispatcher (or a clone of it) allocated that
    /// is still waiting for delivery.
    ///
    /// Call from the host's shutdown path once it will no longer deliver.
    /// Tokens of other dispatchers on the same registry are left alone.
    /// Blocked `send` calls waiting on released tokens fail with
    /// [`DispatchFailure`](crate::error::Error::DispatchFailure). Returns the
    /// number of released tokens.
    pub fn shutdown(&self) -> usize {
        let tokens: Vec<DispatchToken> = self.ledger.tokens.lock().drain().collect();
        let released = self.registry.cancel_many(tokens);
        log::info!("dispatcher shut down, {} undelivered tokens released", released);
        released
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
