use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use super::Variable;
use crate::error::{CommErr, Result};

/// A named key-to-tensor store.
///
/// Every variable lives behind its own lock, so concurrent per-variable tasks
/// only contend when they touch the same variable. The strategies write to a
/// store only from their background threads, training threads just read and
/// feed it through `set`.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: RwLock<HashMap<String, Arc<RwLock<Variable>>>>,
}

impl VariableStore {
    /// Creates a new empty `VariableStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`.
    ///
    /// If the name already exists the value is replaced in place, so handles
    /// previously returned by `get` observe the new value.
    pub fn set(&self, name: &str, value: Variable) {
        if let Some(slot) = self.vars.read().get(name) {
            *slot.write() = value;
            return;
        }

        self.vars
            .write()
            .entry(name.to_string())
            .and_modify(|slot| *slot.write() = value.clone())
            .or_insert_with(|| Arc::new(RwLock::new(value)));
    }

    /// Returns a shared handle to the variable stored under `name`.
    ///
    /// # Returns
    /// A `MissingVariable` error if there is no such variable.
    pub fn get(&self, name: &str) -> Result<Arc<RwLock<Variable>>> {
        self.vars
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CommErr::MissingVariable(name.to_string()))
    }

    /// Returns a snapshot copy of the variable stored under `name`.
    pub fn snapshot(&self, name: &str) -> Result<Variable> {
        Ok(self.get(name)?.read().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.read().contains_key(name)
    }

    /// Returns the stored names in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.vars.read().keys().cloned().collect()
    }
}
