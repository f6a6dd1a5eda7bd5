//! Item identifiers, revisions and the maps built from them.

use std::borrow::Borrow;
use std::collections::{hash_map, BTreeSet, HashMap};
use std::fmt;

/// Local unique identifier of an item within one source.
///
/// LUIDs are chosen by the backend (or by [`crate::ItemIdAllocator`]) and are
/// opaque to everything above it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Luid(String);

impl Luid {
    /// Creates a LUID from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the LUID as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the numeric value if the LUID is a plain decimal number.
    #[must_use]
    pub fn as_number(&self) -> Option<u64> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.0.parse().ok()
    }
}

impl fmt::Debug for Luid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Luid({:?})", self.0)
    }
}

impl fmt::Display for Luid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Luid {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for Luid {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for Luid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Luid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque revision string of an item.
///
/// Only equality matters: the same revision means the content is unchanged
/// since it was last observed. Commonly a modification time in decimal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// Creates a revision from any string.
    #[must_use]
    pub fn new(revision: impl Into<String>) -> Self {
        Self(revision.into())
    }

    /// Returns the revision as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Revision({:?})", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(revision: &str) -> Self {
        Self(revision.to_string())
    }
}

impl From<String> for Revision {
    fn from(revision: String) -> Self {
        Self(revision)
    }
}

/// Mapping from LUID to revision for all items of one source.
///
/// Each LUID appears at most once; iteration order is unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionMap {
    entries: HashMap<Luid, Revision>,
}

impl RevisionMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the revision of an item.
    ///
    /// Returns the previous revision, if any.
    pub fn insert(&mut self, luid: impl Into<Luid>, revision: impl Into<Revision>) -> Option<Revision> {
        self.entries.insert(luid.into(), revision.into())
    }

    /// Returns the revision of an item.
    #[must_use]
    pub fn get(&self, luid: &str) -> Option<&Revision> {
        self.entries.get(luid)
    }

    /// Removes an item, returning its revision.
    pub fn remove(&mut self, luid: &str) -> Option<Revision> {
        self.entries.remove(luid)
    }

    /// Returns true if the item is in the map.
    #[must_use]
    pub fn contains(&self, luid: &str) -> bool {
        self.entries.contains_key(luid)
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all items.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates over all `(luid, revision)` pairs.
    pub fn iter(&self) -> hash_map::Iter<'_, Luid, Revision> {
        self.entries.iter()
    }

    /// Iterates over all LUIDs.
    pub fn luids(&self) -> impl Iterator<Item = &Luid> {
        self.entries.keys()
    }
}

impl<K, V> FromIterator<(K, V)> for RevisionMap
where
    K: Into<Luid>,
    V: Into<Revision>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for RevisionMap {
    type Item = (Luid, Revision);
    type IntoIter = hash_map::IntoIter<Luid, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a RevisionMap {
    type Item = (&'a Luid, &'a Revision);
    type IntoIter = hash_map::Iter<'a, Luid, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// How an item changed since the last sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Item is new.
    Added,
    /// Item content changed.
    Updated,
    /// Item was removed.
    Deleted,
    /// Item is unchanged and not part of the sync traffic.
    Unchanged,
}

/// Result of comparing the current revisions with the previous ones.
///
/// `added`, `updated`, `deleted` and `unchanged` are pairwise disjoint and
/// together cover every LUID of both maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// LUIDs only present in the current map.
    pub added: BTreeSet<Luid>,
    /// LUIDs present in both maps with different revisions.
    pub updated: BTreeSet<Luid>,
    /// LUIDs only present in the previous map.
    pub deleted: BTreeSet<Luid>,
    /// LUIDs present in both maps with the same revision.
    pub unchanged: BTreeSet<Luid>,
}

impl ChangeSet {
    /// Creates a change set reporting every item of `current` as added.
    ///
    /// Used for slow syncs and for sources without revision tracking.
    #[must_use]
    pub fn all_added(current: &RevisionMap) -> Self {
        Self {
            added: current.luids().cloned().collect(),
            ..Self::default()
        }
    }

    /// Returns true if nothing needs to be sent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Returns the number of changes (unchanged items excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    /// Returns how an item is classified, if it is known at all.
    #[must_use]
    pub fn state_of(&self, luid: &str) -> Option<ItemState> {
        if self.added.contains(luid) {
            Some(ItemState::Added)
        } else if self.updated.contains(luid) {
            Some(ItemState::Updated)
        } else if self.deleted.contains(luid) {
            Some(ItemState::Deleted)
        } else if self.unchanged.contains(luid) {
            Some(ItemState::Unchanged)
        } else {
            None
        }
    }
}
