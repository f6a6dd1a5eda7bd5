//! Change detection by revision comparison.

use crate::types::{ChangeSet, RevisionMap};

/// Classifies every item of `current` and `previous`.
///
/// - present only in `current`: added
/// - present only in `previous`: deleted
/// - present in both with different revisions: updated
/// - present in both with equal revisions: unchanged
///
/// An item that was deleted and re-created under the same LUID with the same
/// revision is indistinguishable from an unchanged one.
#[must_use]
pub fn compute_changes(current: &RevisionMap, previous: &RevisionMap) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (luid, revision) in current {
        match previous.get(luid.as_str()) {
            None => changes.added.insert(luid.clone()),
            Some(old) if old != revision => changes.updated.insert(luid.clone()),
            Some(_) => changes.unchanged.insert(luid.clone()),
        };
    }

    for luid in previous.luids() {
        if !current.contains(luid.as_str()) {
            changes.deleted.insert(luid.clone());
        }
    }

    changes
}
