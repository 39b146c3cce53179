//! Staged mutation ledger
//!
//! Records add / remove / update / clear intents against the named child
//! collections of one resource without touching its representation. The
//! commit engine replays the ledger onto a working copy in a fixed order, so
//! the outcome does not depend on the order the fluent calls were made in.

use crate::error::{FluentError, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// In-place edit of a child payload. Replayable, so a failed commit can be retried.
pub type Mutator = Arc<dyn Fn(&mut Value) + Send + Sync>;

/// Lifecycle tag of a named child entity between two commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Loaded from the remote representation, untouched
    Existing,
    /// Staged for creation
    ToAdd,
    /// Staged for deletion
    ToRemove,
    /// Existing with queued local edits
    ToUpdate,
}

/// Pending operations for one collection
#[derive(Clone, Default)]
pub struct PendingCollection {
    adds: Vec<(String, Value)>,
    removes: BTreeSet<String>,
    updates: Vec<(String, Mutator)>,
    clear: bool,
}

impl PendingCollection {
    /// Staged additions in staging order
    pub fn adds(&self) -> &[(String, Value)] {
        &self.adds
    }

    pub fn removes(&self) -> &BTreeSet<String> {
        &self.removes
    }

    pub fn updates(&self) -> &[(String, Mutator)] {
        &self.updates
    }

    /// Whether everything present before the commit is to be detached
    pub fn clears(&self) -> bool {
        self.clear
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.updates.is_empty() && !self.clear
    }

    pub(crate) fn add_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.adds
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, payload)| payload)
    }

    fn has_add(&self, name: &str) -> bool {
        self.adds.iter().any(|(n, _)| n == name)
    }
}

impl fmt::Debug for PendingCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCollection")
            .field("adds", &self.adds.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("removes", &self.removes)
            .field("updates", &self.updates.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("clear", &self.clear)
            .finish()
    }
}

/// Pending operation set of one parent resource
#[derive(Clone, Default)]
pub struct Ledger {
    /// Registration order doubles as application order
    collections: Vec<(String, PendingCollection)>,
    /// Edits to the resource's own top-level fields
    root_updates: Vec<Mutator>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("collections", &self.collections)
            .field("root_updates", &self.root_updates.len())
            .finish()
    }
}

impl Ledger {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            collections: names
                .into_iter()
                .map(|n| (n.to_string(), PendingCollection::default()))
                .collect(),
            root_updates: Vec::new(),
        }
    }

    fn collection_mut(&mut self, collection: &str) -> Result<&mut PendingCollection> {
        self.collections
            .iter_mut()
            .find(|(n, _)| n == collection)
            .map(|(_, pending)| pending)
            .ok_or_else(|| FluentError::UnknownCollection(collection.to_string()))
    }

    pub fn pending(&self, collection: &str) -> Result<&PendingCollection> {
        self.collections
            .iter()
            .find(|(n, _)| n == collection)
            .map(|(_, pending)| pending)
            .ok_or_else(|| FluentError::UnknownCollection(collection.to_string()))
    }

    pub fn knows(&self, collection: &str) -> bool {
        self.collections.iter().any(|(n, _)| n == collection)
    }

    /// Stage a new entity. Returns `false` if the name was already staged.
    pub fn stage_add(&mut self, collection: &str, name: &str, payload: Value) -> Result<bool> {
        let pending = self.collection_mut(collection)?;
        if pending.has_add(name) {
            tracing::debug!("{}/{} already staged for add", collection, name);
            return Ok(false);
        }
        tracing::debug!("staged add {}/{}", collection, name);
        pending.adds.push((name.to_string(), payload));
        Ok(true)
    }

    /// Stage a removal. A pending add of the same name is cancelled instead,
    /// together with its queued updates; returns `true` in that case.
    pub fn stage_remove(&mut self, collection: &str, name: &str) -> Result<bool> {
        let pending = self.collection_mut(collection)?;
        if pending.has_add(name) {
            tracing::debug!("cancelled pending add {}/{}", collection, name);
            pending.adds.retain(|(n, _)| n != name);
            pending.updates.retain(|(n, _)| n != name);
            return Ok(true);
        }
        tracing::debug!("staged remove {}/{}", collection, name);
        pending.removes.insert(name.to_string());
        pending.updates.retain(|(n, _)| n != name);
        Ok(false)
    }

    /// Stage an edit. Pending adds are edited immediately, existing entities
    /// get the mutator queued for commit time.
    pub fn stage_update(&mut self, collection: &str, name: &str, mutator: Mutator) -> Result<()> {
        let pending = self.collection_mut(collection)?;
        if let Some(payload) = pending.add_mut(name) {
            mutator(payload);
            return Ok(());
        }
        tracing::debug!("staged update {}/{}", collection, name);
        pending.updates.push((name.to_string(), mutator));
        Ok(())
    }

    /// Stage removal of everything the collection holds before this commit.
    /// Additions staged in the same cycle still apply afterwards.
    pub fn stage_clear(&mut self, collection: &str) -> Result<()> {
        let pending = self.collection_mut(collection)?;
        tracing::debug!("staged clear {}", collection);
        pending.clear = true;
        pending.updates.clear();
        Ok(())
    }

    /// Stage an edit of the resource itself (sku, location, profile fields).
    pub fn stage_root_update(&mut self, mutator: Mutator) {
        self.root_updates.push(mutator);
    }

    pub fn root_updates(&self) -> &[Mutator] {
        &self.root_updates
    }

    pub(crate) fn pending_add_mut(&mut self, collection: &str, name: &str) -> Option<&mut Value> {
        self.collection_mut(collection).ok()?.add_mut(name)
    }

    /// Lifecycle tag of `name`, given whether the representation holds it.
    pub fn state_of(&self, collection: &str, name: &str, exists: bool) -> Option<EntityState> {
        let pending = self.pending(collection).ok()?;
        if pending.has_add(name) {
            return Some(EntityState::ToAdd);
        }
        if !exists {
            return None;
        }
        if pending.clear || pending.removes.contains(name) {
            return Some(EntityState::ToRemove);
        }
        if pending.updates.iter().any(|(n, _)| n == name) {
            return Some(EntityState::ToUpdate);
        }
        Some(EntityState::Existing)
    }

    /// Collections in application order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PendingCollection)> {
        self.collections.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn is_empty(&self) -> bool {
        self.root_updates.is_empty() && self.collections.iter().all(|(_, p)| p.is_empty())
    }

    /// Forget every staged operation
    pub fn clear(&mut self) {
        for (_, pending) in &mut self.collections {
            *pending = PendingCollection::default();
        }
        self.root_updates.clear();
    }
}
