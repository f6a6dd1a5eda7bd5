//! In-memory backend with failure injection.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use syncevo_source::{
    InsertItemResult, ItemIdAllocator, Luid, RevisionMap, SourceError, SourceResult, SyncSource,
};

#[derive(Debug, Default)]
struct MemoryState {
    items: BTreeMap<Luid, (Vec<u8>, u64)>,
    allocator: ItemIdAllocator,
    clock: u64,
    open: bool,
    opened: u32,
    fail_open: Option<String>,
    fail_storage: Option<String>,
    fail_insert: BTreeSet<Luid>,
    fail_read: BTreeSet<Luid>,
    fail_remove: BTreeSet<Luid>,
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// A backend keeping items in memory.
///
/// Clones share the items, so a test can hand one clone to a
/// [`syncevo_source::Source`] and inspect or modify the data through
/// another. Revisions come from a counter bumped by every write.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    name: String,
    mime_type: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: "text/plain".to_string(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Sets the item MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Adds an item.
    pub fn with_item(self, luid: &str, data: impl AsRef<[u8]>) -> Self {
        self.set_item(luid, data);
        self
    }

    /// Creates or changes an item as a local edit would.
    pub fn set_item(&self, luid: &str, data: impl AsRef<[u8]>) {
        let mut state = self.state.lock();
        let luid = Luid::new(luid);
        state.allocator.observe(&luid);
        let revision = state.tick();
        state.items.insert(luid, (data.as_ref().to_vec(), revision));
    }

    /// Removes an item as a local edit would.
    pub fn remove(&self, luid: &str) -> bool {
        self.state.lock().items.remove(luid).is_some()
    }

    /// Returns the content of an item.
    pub fn item(&self, luid: &str) -> Option<Vec<u8>> {
        self.state.lock().items.get(luid).map(|(data, _)| data.clone())
    }

    /// Returns all LUIDs, sorted.
    pub fn luids(&self) -> Vec<Luid> {
        self.state.lock().items.keys().cloned().collect()
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if there are no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while the backend is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Returns how often the backend was opened.
    pub fn open_count(&self) -> u32 {
        self.state.lock().opened
    }

    /// Makes `open()` fail.
    pub fn fail_open(&self, reason: impl Into<String>) {
        self.state.lock().fail_open = Some(reason.into());
    }

    /// Makes every following item operation fail with a storage error.
    pub fn fail_storage(&self, reason: impl Into<String>) {
        self.state.lock().fail_storage = Some(reason.into());
    }

    /// Makes updates of `luid` fail with an item-level error.
    pub fn fail_insert(&self, luid: &str) {
        self.state.lock().fail_insert.insert(Luid::new(luid));
    }

    /// Makes reads of `luid` fail with an item-level error.
    pub fn fail_read(&self, luid: &str) {
        self.state.lock().fail_read.insert(Luid::new(luid));
    }

    /// Makes removal of `luid` fail with an item-level error.
    pub fn fail_remove(&self, luid: &str) {
        self.state.lock().fail_remove.insert(Luid::new(luid));
    }

    /// Removes all injected failures.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_open = None;
        state.fail_storage = None;
        state.fail_insert.clear();
        state.fail_read.clear();
        state.fail_remove.clear();
    }

    fn check(&self, state: &MemoryState) -> SourceResult<()> {
        if let Some(reason) = &state.fail_storage {
            return Err(SourceError::fatal(&self.name, reason.clone()));
        }
        if !state.open {
            return Err(SourceError::NotOpen(self.name.clone()));
        }
        Ok(())
    }
}

impl SyncSource for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn open(&mut self) -> SourceResult<()> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.fail_open {
            return Err(SourceError::fatal(&self.name, reason.clone()));
        }
        state.open = true;
        state.opened += 1;
        Ok(())
    }

    fn close(&mut self) -> SourceResult<()> {
        self.state.lock().open = false;
        Ok(())
    }

    fn list_all_items(&mut self) -> SourceResult<RevisionMap> {
        let state = self.state.lock();
        self.check(&state)?;
        Ok(state
            .items
            .iter()
            .map(|(luid, (_, revision))| (luid.clone(), revision.to_string()))
            .collect())
    }

    fn read_item(&mut self, luid: &Luid) -> SourceResult<Vec<u8>> {
        let state = self.state.lock();
        self.check(&state)?;
        if state.fail_read.contains(luid) {
            return Err(SourceError::item_failure(&self.name, format!("cannot read {luid}")));
        }
        state
            .items
            .get(luid)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| SourceError::NotFound(luid.clone()))
    }

    fn insert_item(&mut self, luid: Option<&Luid>, data: &[u8]) -> SourceResult<InsertItemResult> {
        let mut state = self.state.lock();
        self.check(&state)?;
        let (luid, was_update) = match luid {
            Some(luid) => {
                if state.fail_insert.contains(luid) {
                    return Err(SourceError::InvalidItem {
                        luid: luid.clone(),
                        message: "rejected by backend".to_string(),
                    });
                }
                (luid.clone(), state.items.contains_key(luid))
            }
            None => {
                let MemoryState {
                    allocator, items, ..
                } = &mut *state;
                let luid = allocator.allocate_with(|candidate| Ok(items.contains_key(candidate)))?;
                (luid, false)
            }
        };
        let revision = state.tick();
        state.items.insert(luid.clone(), (data.to_vec(), revision));
        Ok(InsertItemResult::new(luid, revision.to_string(), was_update))
    }

    fn remove_item(&mut self, luid: &Luid) -> SourceResult<()> {
        let mut state = self.state.lock();
        self.check(&state)?;
        if state.fail_remove.contains(luid) {
            return Err(SourceError::item_failure(&self.name, format!("cannot remove {luid}")));
        }
        state
            .items
            .remove(luid)
            .map(|_| ())
            .ok_or_else(|| SourceError::NotFound(luid.clone()))
    }
}
