//! Callback storage.
//!
//! Script callables are held under opaque handles in named spaces
//! (`ruleFuncs`, `processes`); timer callbacks live in their own
//! slot-keyed table on the engine. Handles are released explicitly.

use std::collections::HashMap;

use tracing::debug;

use crate::script::Callable;

/// Opaque handle to a stored script callable. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One named space of callables with monotonically allocated handles.
pub(crate) struct CallbackSpace {
    name: &'static str,
    next_id: u64,
    funcs: HashMap<CallbackId, Callable>,
}

impl CallbackSpace {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: 1,
            funcs: HashMap::new(),
        }
    }

    pub fn store(&mut self, f: Callable) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.funcs.insert(id, f);
        id
    }

    /// Clone the callable out so it can be invoked while the engine is
    /// borrowed mutably.
    pub fn get(&self, id: CallbackId) -> Option<Callable> {
        self.funcs.get(&id).cloned()
    }

    pub fn remove(&mut self, id: CallbackId) {
        if self.funcs.remove(&id).is_none() {
            debug!(space = self.name, callback = %id, "removing unknown callback");
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.funcs.len()
    }
}
