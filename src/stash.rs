//! Object stash for values the wire format cannot carry.
//!
//! Plugin data and captured error objects are handed to the worker as small
//! integer handles and resolved back to the same `Arc` when they return, so
//! identity survives the round trip.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// A value held by the stash.
pub type Stashed = Arc<dyn Any + Send + Sync>;

/// Handle reserved for "no value".
pub const NO_VALUE: i32 = -1;

#[derive(Default)]
struct StashState {
    values: HashMap<i32, Stashed>,
    next_id: i32,
}

/// Table mapping integer handles to stashed values.
///
/// Allocation is monotonic across `clear()` calls, so a stale handle from a
/// previous build can never alias a new value.
#[derive(Default)]
pub struct ObjectStash {
    state: Mutex<StashState>,
}

impl std::fmt::Debug for ObjectStash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ObjectStash")
            .field("len", &state.values.len())
            .field("next_id", &state.next_id)
            .finish()
    }
}

impl ObjectStash {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StashState> {
        // a panic while holding this lock cannot leave the map inconsistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a value and return its handle; `None` maps to [`NO_VALUE`].
    pub fn store(&self, value: Option<Stashed>) -> i32 {
        let Some(value) = value else {
            return NO_VALUE;
        };
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.values.insert(id, value);
        id
    }

    /// Look up a handle; unknown handles and [`NO_VALUE`] yield `None`.
    pub fn load(&self, id: i32) -> Option<Stashed> {
        if id == NO_VALUE {
            return None;
        }
        self.lock().values.get(&id).cloned()
    }

    /// Drop every stored value. Handles keep counting up.
    pub fn clear(&self) {
        self.lock().values.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Downcast a stashed value to a concrete type.
pub fn downcast<T: Any + Send + Sync>(value: &Stashed) -> Option<&T> {
    value.downcast_ref::<T>()
}
