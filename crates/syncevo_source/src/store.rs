//! Persistence of revision maps between sessions.

use crate::error::SourceResult;
use crate::types::RevisionMap;
use std::collections::BTreeMap;
use syncevo_storage::ConfigNode;
use tracing::debug;

/// Persists the LUID to revision map of one source for one peer.
///
/// Backed by a tracking node: one property per item, the LUID as key and
/// the revision as value.
pub struct RevisionStore {
    node: Box<dyn ConfigNode>,
}

impl RevisionStore {
    /// Creates a store on top of a tracking node.
    pub fn new(node: impl ConfigNode + 'static) -> Self {
        Self {
            node: Box::new(node),
        }
    }

    /// Returns the name of the underlying node.
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Returns true if a map was ever saved.
    ///
    /// A store without a saved map forces a slow sync.
    pub fn exists(&self) -> bool {
        self.node.exists()
    }

    /// Loads the map saved by the last successful session.
    ///
    /// Returns an empty map if nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be read.
    pub fn load(&self) -> SourceResult<RevisionMap> {
        let map: RevisionMap = self.node.read_properties()?.into_iter().collect();
        debug!(node = self.node.name(), items = map.len(), "revisions loaded");
        Ok(map)
    }

    /// Replaces the saved map.
    ///
    /// All-or-nothing: if this fails, [`RevisionStore::load`] still returns
    /// the previously saved map.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be written.
    pub fn save(&mut self, map: &RevisionMap) -> SourceResult<()> {
        let properties: BTreeMap<String, String> = map
            .iter()
            .map(|(luid, revision)| (luid.to_string(), revision.to_string()))
            .collect();
        self.node.replace_all(properties)?;
        self.node.flush()?;
        debug!(node = self.node.name(), items = map.len(), "revisions saved");
        Ok(())
    }
}

impl std::fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStore")
            .field("node", &self.node.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use proptest::prelude::*;
    use syncevo_storage::{FileNode, InMemoryNode};
    use tempfile::tempdir;

    #[test]
    fn empty_store_loads_empty_map() {
        let store = RevisionStore::new(InMemoryNode::new("tracking"));
        assert!(!store.exists());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_replaces_previous_map() {
        let node = InMemoryNode::new("tracking");
        let mut store = RevisionStore::new(node.clone());

        let first: RevisionMap = [("1", "a"), ("2", "b")].into_iter().collect();
        store.save(&first).unwrap();

        let second: RevisionMap = [("2", "c")].into_iter().collect();
        store.save(&second).unwrap();

        assert_eq!(store.load().unwrap(), second);
        assert_eq!(node.snapshot().len(), 1);
    }

    #[test]
    fn failed_save_keeps_previous_map() {
        let node = InMemoryNode::new("tracking");
        let mut store = RevisionStore::new(node.clone());

        let saved: RevisionMap = [("1", "a")].into_iter().collect();
        store.save(&saved).unwrap();

        node.reject_writes(true);
        let next: RevisionMap = [("1", "b"), ("2", "c")].into_iter().collect();
        let result = store.save(&next);

        assert!(matches!(result, Err(SourceError::Storage(_))));
        assert_eq!(store.load().unwrap(), saved);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addressbook.ini");
        let map: RevisionMap = [("10", "1700000000"), ("11", "1700000001")]
            .into_iter()
            .collect();

        {
            let mut store = RevisionStore::new(FileNode::open(&path).unwrap());
            store.save(&map).unwrap();
        }

        let store = RevisionStore::new(FileNode::open(&path).unwrap());
        assert!(store.exists());
        assert_eq!(store.load().unwrap(), map);
    }

    proptest! {
        #[test]
        fn saved_map_loads_back(
            entries in prop::collection::hash_map("[ -~]{1,16}", "[0-9]{1,20}", 1..30)
        ) {
            let map: RevisionMap = entries.into_iter().collect();
            let mut store = RevisionStore::new(InMemoryNode::new("tracking"));
            store.save(&map).unwrap();
            prop_assert_eq!(store.load().unwrap(), map);
        }
    }
}
