//! Registry of uniquely named middleware, independent of any chain.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use parking_lot::RwLock;

use super::{ChainError, Middleware};

/// Name-keyed store of middleware instances.
///
/// A registered middleware is not part of any chain until it is added to one;
/// chains built from the registry hold their own clones.
pub struct MiddlewareRegistry<Req, Res, E> {
    entries: RwLock<HashMap<String, Middleware<Req, Res, E>>>,
}

impl<Req, Res, E> Default for MiddlewareRegistry<Req, Res, E> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<Req, Res, E> MiddlewareRegistry<Req, Res, E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// [`ChainError::MiddlewareExists`] if the name is taken.
    pub fn register(&self, middleware: Middleware<Req, Res, E>) -> Result<(), ChainError> {
        match self.entries.write().entry(middleware.name().to_string()) {
            Entry::Occupied(entry) => Err(ChainError::MiddlewareExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(middleware);
                Ok(())
            }
        }
    }

    /// # Errors
    /// [`ChainError::MiddlewareNotFound`] if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Middleware<Req, Res, E>, ChainError> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ChainError::MiddlewareNotFound(name.to_string()))
    }

    /// # Errors
    /// [`ChainError::MiddlewareNotFound`] if nothing is registered under `name`.
    pub fn unregister(&self, name: &str) -> Result<Middleware<Req, Res, E>, ChainError> {
        self.entries
            .write()
            .remove(name)
            .ok_or_else(|| ChainError::MiddlewareNotFound(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Registered names, ordered by priority then name.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut entries: Vec<(i32, String)> = self
            .entries
            .read()
            .values()
            .map(|m| (m.priority(), m.name().to_string()))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, name)| name).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
