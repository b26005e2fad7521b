//! In-memory entity registry.
//!
//! A [`Registry`] is the storage unit every feature is built from: a map from string ID
//! to entity that remembers insertion order. It has no interior locking; the owning
//! feature state sits behind the dispatcher's lock, so the last write wins.
//!
//! # Example
//!
//! ```
//! use starport_core::registry::Registry;
//!
//! let mut planets = Registry::new("Planet");
//! planets.put("kepler-186f", 0.61_f64);
//! planets.put("trappist-1e", 0.85_f64);
//! planets.put("kepler-186f", 0.64_f64); // overwrite keeps position
//!
//! assert_eq!(planets.ids(), vec!["kepler-186f", "trappist-1e"]);
//! assert_eq!(planets.get("kepler-186f"), Some(&0.64));
//! ```

use crate::error::LifecycleError;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Entities that know their own registry key
pub trait Entity {
    /// Registry key
    fn id(&self) -> &str;
}

/// Insertion-ordered in-memory store keyed by string IDs.
#[derive(Debug, Clone)]
pub struct Registry<V> {
    kind: &'static str,
    entries: HashMap<String, V>,
    order: Vec<String>,
}

impl<V> Registry<V> {
    /// Create an empty registry; `kind` names the entity in error messages
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Entity kind label
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Insert or overwrite `id`, returning the stored value
    ///
    /// Colliding IDs are not rejected. An overwritten entry keeps its original
    /// position in [`iter`](Self::iter) order.
    pub fn put(&mut self, id: impl Into<String>, value: V) -> &V {
        match self.entries.entry(id.into()) {
            Entry::Occupied(mut slot) => {
                tracing::trace!(kind = self.kind, id = %slot.key(), "Overwriting registry entry");
                slot.insert(value);
                slot.into_mut()
            }
            Entry::Vacant(slot) => {
                self.order.push(slot.key().clone());
                slot.insert(value)
            }
        }
    }

    /// Look up an entry
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&V> {
        self.entries.get(id)
    }

    /// Look up an entry and copy it out
    #[must_use]
    pub fn get_cloned(&self, id: &str) -> Option<V>
    where
        V: Clone,
    {
        self.entries.get(id).cloned()
    }

    /// Look up an entry that must exist
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] naming `id` when it is absent.
    pub fn require(&self, id: &str) -> Result<&V, LifecycleError> {
        self.entries
            .get(id)
            .ok_or_else(|| LifecycleError::not_found(self.kind, id))
    }

    /// Mutable variant of [`require`](Self::require)
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] naming `id` when it is absent.
    pub fn require_mut(&mut self, id: &str) -> Result<&mut V, LifecycleError> {
        let kind = self.kind;
        self.entries
            .get_mut(id)
            .ok_or_else(|| LifecycleError::not_found(kind, id))
    }

    /// Mutate an existing entry in place
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when `id` is absent; `f` is not called.
    pub fn update<R>(&mut self, id: &str, f: impl FnOnce(&mut V) -> R) -> Result<R, LifecycleError> {
        self.require_mut(id).map(f)
    }

    /// Whether `id` is present
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &V> + '_ {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Copies of the entries matching `predicate`, in insertion order
    #[must_use]
    pub fn list(&self, predicate: impl Fn(&V) -> bool) -> Vec<V>
    where
        V: Clone,
    {
        self.iter().filter(|v| predicate(v)).cloned().collect()
    }

    /// Copies of every entry, in insertion order
    #[must_use]
    pub fn list_all(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.iter().cloned().collect()
    }

    /// IDs in insertion order
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Remove an entry
    pub fn remove(&mut self, id: &str) -> Option<V> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Entity> Registry<V> {
    /// Insert an entity under its own ID
    pub fn insert(&mut self, entity: V) -> &V {
        let id = entity.id().to_owned();
        self.put(id, entity)
    }
}
