//! Build handle registry.
//!
//! Each build or context is addressed by the worker through its build key.
//! The registry maps keys to per-command inbound handlers and keeps a
//! reference count per handle; the entry disappears exactly when the count
//! drops to zero, after which late worker requests for that key are
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;

use crate::error::Result;
use crate::protocol::Value;
use crate::protocol::codec::ID_MASK;

/// Handler for one inbound command on one build handle.
pub type InboundHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Per-command handler table for a build handle.
pub type HandlerTable = HashMap<String, InboundHandler>;

struct HandleEntry {
    ref_count: usize,
    handlers: HandlerTable,
}

/// Result of routing an inbound request.
pub enum Lookup {
    /// No handle for that key (disposed, or never registered).
    NoHandle,
    /// The handle exists but has no handler for that command.
    NoCommand,
    Found(InboundHandler),
}

/// Registry of live build handles, private to one channel.
#[derive(Default)]
pub struct HandleRegistry {
    entries: Mutex<HashMap<u32, HandleEntry>>,
    next_key: AtomicU32,
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.lock().len())
            .field("next_key", &self.next_key.load(Ordering::SeqCst))
            .finish()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, HandleEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a fresh build key.
    pub fn allocate_key(&self) -> u32 {
        self.next_key
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |key| Some((key + 1) & ID_MASK))
            .unwrap_or_else(|key| key)
    }

    /// Register a handle and take its first reference.
    pub fn register(self: &Arc<Self>, key: u32, handlers: HandlerTable) -> HandleRef {
        let previous = self.lock().insert(
            key,
            HandleEntry {
                ref_count: 1,
                handlers,
            },
        );
        if previous.is_some() {
            tracing::warn!(key, "build key registered twice; previous handle replaced");
        }
        tracing::debug!(key, "build handle registered");
        HandleRef {
            registry: Arc::clone(self),
            key,
        }
    }

    /// Add or replace one handler on a live handle.
    pub fn add_handler(&self, key: u32, command: &str, handler: InboundHandler) -> bool {
        match self.lock().get_mut(&key) {
            Some(entry) => {
                entry.handlers.insert(command.to_string(), handler);
                true
            }
            None => false,
        }
    }

    /// Remove one handler from a live handle. Returns false if it was absent.
    pub fn remove_handler(&self, key: u32, command: &str) -> bool {
        self.lock()
            .get_mut(&key)
            .is_some_and(|entry| entry.handlers.remove(command).is_some())
    }

    /// Increment the count of a live handle. Returns false if it is gone.
    pub fn ref_handle(&self, key: u32) -> bool {
        match self.lock().get_mut(&key) {
            Some(entry) => {
                entry.ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the count of a live handle, removing it at zero.
    ///
    /// Returns true if this call removed the handle. Unknown keys are a
    /// no-op, so the count can never go negative.
    pub fn unref_handle(&self, key: u32) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&key) else {
            return false;
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            entries.remove(&key);
            tracing::debug!(key, "build handle retired");
            true
        } else {
            false
        }
    }

    pub fn ref_count(&self, key: u32) -> Option<usize> {
        self.lock().get(&key).map(|e| e.ref_count)
    }

    pub fn contains(&self, key: u32) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Route by `(key, command)`.
    pub fn lookup(&self, key: u32, command: &str) -> Lookup {
        match self.lock().get(&key) {
            None => Lookup::NoHandle,
            Some(entry) => match entry.handlers.get(command) {
                Some(handler) => Lookup::Found(Arc::clone(handler)),
                None => Lookup::NoCommand,
            },
        }
    }
}

/// One counted reference to a build handle; released on drop.
pub struct HandleRef {
    registry: Arc<HandleRegistry>,
    key: u32,
}

impl std::fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRef").field("key", &self.key).finish()
    }
}

impl HandleRef {
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Take another reference; `None` if the handle is already retired.
    pub fn try_clone(&self) -> Option<HandleRef> {
        self.registry.ref_handle(self.key).then(|| HandleRef {
            registry: Arc::clone(&self.registry),
            key: self.key,
        })
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.registry.unref_handle(self.key);
    }
}
