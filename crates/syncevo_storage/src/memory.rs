//! In-memory tracking node for testing.

use crate::error::{StorageError, StorageResult};
use crate::node::ConfigNode;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    properties: BTreeMap<String, String>,
    written: bool,
    reject_writes: bool,
}

/// An in-memory tracking node.
///
/// Clones share the same properties, so a test can keep one handle and hand
/// another one to the code under test, then inspect what was persisted.
///
/// This node is suitable for:
/// - Unit tests
/// - Integration tests
/// - Sessions that deliberately do not persist change tracking state
///
/// # Example
///
/// ```rust
/// use syncevo_storage::{ConfigNode, InMemoryNode};
///
/// let observer = InMemoryNode::new("items");
/// let mut node = observer.clone();
/// node.set_property("1", "1700000000").unwrap();
/// assert_eq!(observer.get_property("1").unwrap().as_deref(), Some("1700000000"));
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryNode {
    name: String,
    state: Arc<RwLock<State>>,
}

impl InMemoryNode {
    /// Creates a new empty in-memory node.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    /// Creates a node with pre-existing properties.
    ///
    /// Useful for simulating state left behind by a previous session.
    #[must_use]
    pub fn with_properties<I, K, V>(name: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let node = Self::new(name);
        {
            let mut state = node.state.write();
            state.properties = properties
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect();
            state.written = true;
        }
        node
    }

    /// Makes every subsequent write fail with [`StorageError::WriteRejected`].
    ///
    /// Reads keep working. Used to exercise storage failure paths.
    pub fn reject_writes(&self, reject: bool) {
        self.state.write().reject_writes = reject;
    }

    /// Returns a copy of all properties.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.state.read().properties.clone()
    }

    fn check_writable(&self, state: &State) -> StorageResult<()> {
        if state.reject_writes {
            return Err(StorageError::WriteRejected(self.name.clone()));
        }
        Ok(())
    }
}

impl ConfigNode for InMemoryNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_property(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.state.read().properties.get(key).cloned())
    }

    fn set_property(&mut self, key: &str, value: &str) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        state.properties.insert(key.to_string(), value.to_string());
        state.written = true;
        Ok(())
    }

    fn remove_property(&mut self, key: &str) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        state.properties.remove(key);
        Ok(())
    }

    fn read_properties(&self) -> StorageResult<BTreeMap<String, String>> {
        Ok(self.snapshot())
    }

    fn replace_all(&mut self, properties: BTreeMap<String, String>) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        state.properties = properties;
        state.written = true;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.state.read().written
    }

    fn flush(&mut self) -> StorageResult<()> {
        // Nothing is buffered
        let state = self.state.read();
        self.check_writable(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let node = InMemoryNode::new("test");
        assert!(!node.exists());
        assert!(node.read_properties().unwrap().is_empty());
        assert_eq!(node.name(), "test");
    }

    #[test]
    fn memory_set_and_get() {
        let mut node = InMemoryNode::new("test");
        node.set_property("a", "1").unwrap();
        node.set_property("b", "2").unwrap();

        assert_eq!(node.get_property("a").unwrap().as_deref(), Some("1"));
        assert_eq!(node.get_property("missing").unwrap(), None);
        assert!(node.exists());
    }

    #[test]
    fn memory_clones_share_state() {
        let observer = InMemoryNode::new("test");
        let mut writer = observer.clone();
        writer.set_property("k", "v").unwrap();

        assert_eq!(observer.snapshot().len(), 1);
    }

    #[test]
    fn memory_remove_missing_is_ok() {
        let mut node = InMemoryNode::new("test");
        assert!(node.remove_property("nothing").is_ok());
    }

    #[test]
    fn memory_replace_all() {
        let mut node = InMemoryNode::with_properties("test", [("old", "x")]);

        let mut props = BTreeMap::new();
        props.insert("new".to_string(), "y".to_string());
        node.replace_all(props).unwrap();

        assert_eq!(node.get_property("old").unwrap(), None);
        assert_eq!(node.get_property("new").unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn memory_rejected_writes_leave_content() {
        let mut node = InMemoryNode::with_properties("test", [("keep", "1")]);
        node.reject_writes(true);

        let result = node.replace_all(BTreeMap::new());
        assert!(matches!(result, Err(StorageError::WriteRejected(_))));
        assert!(node.set_property("x", "y").is_err());
        assert!(node.flush().is_err());

        assert_eq!(node.get_property("keep").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn memory_clear() {
        let mut node = InMemoryNode::with_properties("test", [("a", "1"), ("b", "2")]);
        node.clear().unwrap();
        assert!(node.read_properties().unwrap().is_empty());
        assert!(node.exists());
    }
}
