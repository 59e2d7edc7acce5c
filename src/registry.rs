//! Cross-boundary handle registry
//!
//! Turns a closure into a [`DispatchToken`] that a host dispatcher can carry
//! as a plain integer and hand back exactly once. Callbacks live in a slot
//! arena keyed by index and generation; invoking a token removes its slot
//! before the callback runs, so a token can never be invoked twice and its
//! slot is reclaimed even if the callback panics.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use once_cell::sync::Lazy;
use crate::error::{Error, Result};

/// A callback waiting to be delivered to a host thread
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide registry used by dispatchers that don't bring their own
pub static GLOBAL_REGISTRY: Lazy<Arc<HandleRegistry>> = Lazy::new(|| Arc::new(HandleRegistry::new()));

/// Single-use key for a registered callback
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchToken {
    index: u32,
    generation: u32,
}

impl DispatchToken {
    /// Pack the token into an opaque word for the host
    pub fn into_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Rebuild a token from a word previously produced by [`into_raw`](Self::into_raw)
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Debug for DispatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatchToken({}v{})", self.index, self.generation)
    }
}

/// Snapshot of registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Tokens handed out
    pub allocated: usize,
    /// Tokens whose callback was run
    pub invoked: usize,
    /// Tokens released without running
    pub cancelled: usize,
    /// Stale or forged tokens that were rejected
    pub rejected: usize,
}

#[derive(Default)]
struct Counters {
    allocated: AtomicUsize,
    invoked: AtomicUsize,
    cancelled: AtomicUsize,
    rejected: AtomicUsize,
}

struct Slot {
    generation: u32,
    callback: Option<Callback>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
}

impl Arena {
    fn insert_with<B>(&mut self, build: B) -> DispatchToken
    where
        B: FnOnce(DispatchToken) -> Callback,
    {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            let token = DispatchToken { index, generation: slot.generation };
            slot.callback = Some(build(token));
            return token;
        }

        let index = self.slots.len() as u32;
        let token = DispatchToken { index, generation: 1 };
        self.slots.push(Slot { generation: 1, callback: Some(build(token)) });
        token
    }

    fn remove(&mut self, token: DispatchToken) -> Option<Callback> {
        let slot = self.slots.get_mut(token.index as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        let callback = slot.callback.take()?;

        // Generation 0 is never handed out, so a zeroed word is always stale
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free_list.push(token.index);
        self.live -= 1;
        Some(callback)
    }
}

/// Arena of callbacks awaiting delivery by the host
pub struct HandleRegistry {
    arena: Mutex<Arena>,
    counters: Counters,
}

impl HandleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            counters: Counters::default(),
        }
    }

    /// Register a callback and return the token that will run it
    pub fn allocate(&self, callback: Callback) -> DispatchToken {
        self.allocate_with(|_| callback)
    }

    /// Register a callback built from its own token.
    ///
    /// `build` runs under the registry lock and must not call back into the
    /// registry.
    pub fn allocate_with<B>(&self, build: B) -> DispatchToken
    where
        B: FnOnce(DispatchToken) -> Callback,
    {
        let token = self.arena.lock().insert_with(build);
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        log::trace!("allocated {:?}", token);
        token
    }

    /// Run the callback behind `token` and release its slot.
    ///
    /// Called by the host on the target thread. The slot is released before
    /// the callback runs; a panic in the callback is caught and returned as
    /// [`Error::CallbackPanicked`].
    pub fn invoke_and_release(&self, token: DispatchToken) -> Result<()> {
        let callback = self.take(token)?;
        self.counters.invoked.fetch_add(1, Ordering::Relaxed);
        log::trace!("invoking {:?}", token);

        panic::catch_unwind(AssertUnwindSafe(callback)).map_err(|payload| Error::CallbackPanicked {
            reason: panic_message(payload.as_ref()),
        })
    }

    /// Release a token that will never be delivered, dropping its callback unrun
    pub fn cancel(&self, token: DispatchToken) -> Result<()> {
        let callback = self.take(token)?;
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        log::debug!("cancelled undelivered {:?}", token);
        drop(callback);
        Ok(())
    }

    /// Release every outstanding token without running it.
    ///
    /// Intended for host shutdown hooks. Returns how many tokens were released.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Callback> = {
            let mut arena = self.arena.lock();
            let tokens: Vec<DispatchToken> = arena
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.callback.is_some())
                .map(|(index, slot)| DispatchToken { index: index as u32, generation: slot.generation })
                .collect();
            tokens.into_iter().filter_map(|token| arena.remove(token)).collect()
        };

        // Callbacks are dropped outside the lock; their destructors may dispatch again
        let count = drained.len();
        drop(drained);
        if count > 0 {
            self.counters.cancelled.fetch_add(count, Ordering::Relaxed);
            log::info!("released {} undelivered dispatch tokens", count);
        }
        count
    }

    /// Release the given tokens without running them.
    ///
    /// Tokens that were already invoked or released are skipped silently.
    /// Returns how many were released.
    pub fn cancel_many<I>(&self, tokens: I) -> usize
    where
        I: IntoIterator<Item = DispatchToken>,
    {
        let drained: Vec<Callback> = {
            let mut arena = self.arena.lock();
            tokens.into_iter().filter_map(|token| arena.remove(token)).collect()
        };

        let count = drained.len();
        drop(drained);
        if count > 0 {
            self.counters.cancelled.fetch_add(count, Ordering::Relaxed);
            log::debug!("released {} undelivered dispatch tokens", count);
        }
        count
    }

    /// Number of tokens allocated but not yet invoked or cancelled
    pub fn outstanding(&self) -> usize {
        self.arena.lock().live
    }

    /// Whether `token` still refers to a live callback
    pub fn contains(&self, token: DispatchToken) -> bool {
        let arena = self.arena.lock();
        arena
            .slots
            .get(token.index as usize)
            .is_some_and(|slot| slot.generation == token.generation && slot.callback.is_some())
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            allocated: self.counters.allocated.load(Ordering::Relaxed),
            invoked: self.counters.invoked.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn take(&self, token: DispatchToken) -> Result<Callback> {
        let callback = self.arena.lock().remove(token);
        callback.ok_or_else(|| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("rejected stale {:?}", token);
            Error::StaleToken { token: token.into_raw() }
        })
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("outstanding", &self.outstanding())
            .field("stats", &self.stats())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
