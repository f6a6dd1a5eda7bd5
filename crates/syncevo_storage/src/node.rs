//! Tracking node trait definition.

use crate::error::StorageResult;
use std::collections::BTreeMap;

/// A persistent key/value store with string keys and string values.
///
/// Nodes are **opaque property stores**. They know nothing about what the
/// properties mean; change tracking stores one property per item (LUID as key,
/// revision as value), configuration stores one property per setting.
///
/// # Invariants
///
/// - `get_property` returns the value most recently set for a key
/// - `replace_all` applies completely or not at all
/// - `flush` makes all previous modifications durable
/// - Nodes must be `Send` so that a session can move them between threads
///
/// # Implementors
///
/// - [`super::InMemoryNode`] - For testing and volatile state
/// - [`super::FileNode`] - For persistent state in an INI-like file
pub trait ConfigNode: Send {
    /// Returns a name identifying the node in log messages.
    fn name(&self) -> &str;

    /// Reads a single property.
    ///
    /// Returns `None` if the property is not set.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get_property(&self, key: &str) -> StorageResult<Option<String>>;

    /// Sets a single property. The change becomes durable on [`flush`].
    ///
    /// [`flush`]: ConfigNode::flush
    ///
    /// # Errors
    ///
    /// Returns an error if the node rejects the write.
    fn set_property(&mut self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes a property. Removing a missing property is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the node rejects the write.
    fn remove_property(&mut self, key: &str) -> StorageResult<()>;

    /// Returns all properties sorted by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn read_properties(&self) -> StorageResult<BTreeMap<String, String>>;

    /// Replaces the complete content of the node and makes it durable.
    ///
    /// Either all of `properties` become the new content, or the previous
    /// content stays in place. Readers never observe a mix of both.
    ///
    /// # Errors
    ///
    /// Returns an error if the new content could not be written. The old
    /// content is untouched in that case.
    fn replace_all(&mut self, properties: BTreeMap<String, String>) -> StorageResult<()>;

    /// Removes all properties.
    ///
    /// # Errors
    ///
    /// Returns an error if the node rejects the write.
    fn clear(&mut self) -> StorageResult<()> {
        self.replace_all(BTreeMap::new())
    }

    /// Returns true if the node has ever been written.
    ///
    /// A node that does not exist yet reads as empty.
    fn exists(&self) -> bool;

    /// Writes pending modifications to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;
}

impl<N: ConfigNode + ?Sized> ConfigNode for Box<N> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn get_property(&self, key: &str) -> StorageResult<Option<String>> {
        (**self).get_property(key)
    }

    fn set_property(&mut self, key: &str, value: &str) -> StorageResult<()> {
        (**self).set_property(key, value)
    }

    fn remove_property(&mut self, key: &str) -> StorageResult<()> {
        (**self).remove_property(key)
    }

    fn read_properties(&self) -> StorageResult<BTreeMap<String, String>> {
        (**self).read_properties()
    }

    fn replace_all(&mut self, properties: BTreeMap<String, String>) -> StorageResult<()> {
        (**self).replace_all(properties)
    }

    fn clear(&mut self) -> StorageResult<()> {
        (**self).clear()
    }

    fn exists(&self) -> bool {
        (**self).exists()
    }

    fn flush(&mut self) -> StorageResult<()> {
        (**self).flush()
    }
}
