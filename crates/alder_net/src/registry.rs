//! Connection registry keyed by small integer client ids.
//!
//! Iteration order is insertion order, so broadcasts hit peers in the
//! order they joined and stay deterministic across runs.

use std::fmt;

use indexmap::IndexMap;
use thiserror::Error;

/// Identifier the server assigns to a client at CONNECT time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// State mismatches when mutating the registry.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    Duplicate(ClientId),
    #[error("{0} is not registered")]
    Missing(ClientId),
}

/// Insertion-ordered map of live peers.
#[derive(Debug)]
pub struct Registry<T> {
    entries: IndexMap<ClientId, T>,
    next_id: u32,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { entries: IndexMap::new(), next_id: 0 }
    }
}

impl<T> Registry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next unused id. Ids are never reused within a
    /// session, so a stale id can not silently address a new peer.
    pub fn allocate_id(&mut self) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Registers a peer under `id`.
    ///
    /// # Errors
    ///
    /// Fails without overwriting if `id` is already present.
    pub fn insert(&mut self, id: ClientId, value: T) -> Result<(), RegistryError> {
        if self.entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.entries.insert(id, value);
        Ok(())
    }

    /// Removes and returns the peer under `id`.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not present.
    pub fn remove(&mut self, id: ClientId) -> Result<T, RegistryError> {
        self.entries.shift_remove(&id).ok_or(RegistryError::Missing(id))
    }

    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    #[must_use]
    pub fn contains(&self, id: ClientId) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the live ids, for sweeps that mutate the registry
    /// while iterating.
    #[must_use]
    pub fn ids(&self) -> Vec<ClientId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &T)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ClientId, &mut T)> {
        self.entries.iter_mut().map(|(id, v)| (*id, v))
    }
}
