//! A backend composed with optional revision tracking.

use crate::backend::{InsertItemResult, InsertState, SyncSource};
use crate::detector::compute_changes;
use crate::error::{SourceError, SourceResult};
use crate::mode::SyncMode;
use crate::store::RevisionStore;
use crate::types::{ChangeSet, Luid, RevisionMap};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Revision bookkeeping for one source and one peer.
///
/// Holds the map persisted by the last successful session and the items whose
/// processing failed in the current one.
#[derive(Debug)]
pub struct RevisionTracking {
    store: RevisionStore,
    previous: RevisionMap,
    failed: BTreeSet<Luid>,
}

impl RevisionTracking {
    /// Creates tracking state on top of a revision store.
    pub fn new(store: RevisionStore) -> Self {
        Self {
            store,
            previous: RevisionMap::new(),
            failed: BTreeSet::new(),
        }
    }

    /// Returns the map loaded at the start of the session.
    pub fn previous(&self) -> &RevisionMap {
        &self.previous
    }

    /// Returns the items recorded as failed in this session.
    pub fn failed(&self) -> &BTreeSet<Luid> {
        &self.failed
    }

    /// Builds the map to persist: `current` with failed items reverted to
    /// their previous revision, or dropped if they had none.
    fn commit_map(&self, current: &RevisionMap) -> RevisionMap {
        let mut map = current.clone();
        for luid in &self.failed {
            match self.previous.get(luid.as_str()) {
                Some(revision) => {
                    map.insert(luid.clone(), revision.clone());
                }
                None => {
                    map.remove(luid.as_str());
                }
            }
        }
        map
    }
}

/// A sync source: a backend plus optional capabilities.
///
/// # Lifecycle
///
/// 1. [`Source::begin_sync`] opens the backend and detects changes
/// 2. item operations keep the current revision map in step with the backend
/// 3. [`Source::end_sync`] commits the revision map and closes the backend
///
/// Without [`RevisionTracking`] every session reports all items as added.
pub struct Source {
    backend: Box<dyn SyncSource>,
    tracking: Option<RevisionTracking>,
    mode: SyncMode,
    current: RevisionMap,
    open: bool,
    storage_failure: Option<String>,
}

impl Source {
    /// Creates a source without revision tracking.
    pub fn new(backend: impl SyncSource + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            tracking: None,
            mode: SyncMode::TwoWay,
            current: RevisionMap::new(),
            open: false,
            storage_failure: None,
        }
    }

    /// Creates a source whose revisions persist in `store`.
    pub fn with_tracking(backend: impl SyncSource + 'static, store: RevisionStore) -> Self {
        let mut source = Self::new(backend);
        source.tracking = Some(RevisionTracking::new(store));
        source
    }

    /// Returns the backend's name.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Returns the backend's item MIME type.
    pub fn mime_type(&self) -> &str {
        self.backend.mime_type()
    }

    /// Returns the mode of the running session.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Returns the revision tracking capability, if present.
    pub fn tracking(&self) -> Option<&RevisionTracking> {
        self.tracking.as_ref()
    }

    /// Returns the revisions of all items as currently known.
    pub fn current(&self) -> &RevisionMap {
        &self.current
    }

    /// Returns true if the backend is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Returns the storage-level error that disabled the source, if any.
    pub fn storage_failure(&self) -> Option<&str> {
        self.storage_failure.as_deref()
    }

    /// Opens the backend and determines what changed since the last
    /// successful session.
    ///
    /// A disabled source is not opened and reports no changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend or the revision store fail. The
    /// source is unusable for the rest of the session then.
    pub fn begin_sync(&mut self, mode: SyncMode) -> SourceResult<ChangeSet> {
        self.mode = mode;
        self.current.clear();
        self.storage_failure = None;
        if let Some(tracking) = &mut self.tracking {
            tracking.failed.clear();
        }
        if !mode.is_enabled() {
            return Ok(ChangeSet::default());
        }

        let result = self.detect_changes(mode);
        if let Err(err) = &result {
            self.note_failure(err);
        }
        result
    }

    fn detect_changes(&mut self, mode: SyncMode) -> SourceResult<ChangeSet> {
        self.backend.open()?;
        self.open = true;

        if let Some(tracking) = &mut self.tracking {
            tracking.previous = tracking.store.load()?;
        }

        if mode.deletes_local_items() {
            let existing = self.backend.list_all_items()?;
            info!(source = self.backend.name(), items = existing.len(), "wiping local items");
            for luid in existing.luids() {
                match self.backend.remove_item(luid) {
                    Ok(()) => {}
                    Err(SourceError::NotFound(_)) => {
                        debug!(source = self.backend.name(), %luid, "item already gone");
                    }
                    Err(err) => return Err(err),
                }
            }
            return Ok(ChangeSet::default());
        }

        self.current = self.backend.list_all_items()?;

        let changes = match &self.tracking {
            Some(tracking) if !mode.sends_all_items() => {
                compute_changes(&self.current, &tracking.previous)
            }
            _ => ChangeSet::all_added(&self.current),
        };

        info!(
            source = self.backend.name(),
            %mode,
            added = changes.added.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            unchanged = changes.unchanged.len(),
            "changes detected"
        );
        Ok(changes)
    }

    /// Reads the content of an item.
    ///
    /// # Errors
    ///
    /// Returns the backend error. Storage-level errors also disable the
    /// source.
    pub fn read_item(&mut self, luid: &Luid) -> SourceResult<Vec<u8>> {
        self.check_open()?;
        let result = self.backend.read_item(luid);
        self.observe(result)
    }

    /// Adds or updates an item and records its new revision.
    ///
    /// An add whose resulting LUID is already known was a duplicate of an
    /// item created concurrently; it is reported as
    /// [`InsertState::Replaced`].
    ///
    /// # Errors
    ///
    /// Returns the backend error. Storage-level errors also disable the
    /// source.
    pub fn insert_item(&mut self, luid: Option<&Luid>, data: &[u8]) -> SourceResult<InsertItemResult> {
        self.check_open()?;
        let result = self.backend.insert_item(luid, data);
        let mut inserted = self.observe(result)?;

        match luid {
            None if self.current.contains(inserted.luid.as_str()) => {
                debug!(source = self.backend.name(), luid = %inserted.luid, "add replaced existing item");
                inserted.was_update = true;
                if inserted.state == InsertState::Okay {
                    inserted.state = InsertState::Replaced;
                }
            }
            Some(requested) if *requested != inserted.luid => {
                debug!(
                    source = self.backend.name(),
                    from = %requested,
                    to = %inserted.luid,
                    "item moved to new LUID"
                );
                self.current.remove(requested.as_str());
            }
            _ => {}
        }

        self.current.insert(inserted.luid.clone(), inserted.revision.clone());
        Ok(inserted)
    }

    /// Removes an item and forgets its revision.
    ///
    /// # Errors
    ///
    /// Returns the backend error. The item is forgotten even if the backend
    /// reports it as already gone.
    pub fn delete_item(&mut self, luid: &Luid) -> SourceResult<()> {
        self.check_open()?;
        let result = self.backend.remove_item(luid);
        if result.is_ok() || matches!(result, Err(SourceError::NotFound(_))) {
            self.current.remove(luid.as_str());
        }
        self.observe(result)
    }

    /// Marks an item whose processing failed in this session.
    ///
    /// Its revision is not committed, so it shows up as a change again in the
    /// next session.
    pub fn record_failure(&mut self, luid: &Luid) {
        warn!(source = self.backend.name(), %luid, "item failed");
        if let Some(tracking) = &mut self.tracking {
            tracking.failed.insert(luid.clone());
        }
    }

    /// Marks the source as unusable for the rest of the session.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(source = self.backend.name(), %reason, "source failed");
        self.storage_failure = Some(reason);
    }

    /// Ends the session for this source and closes the backend.
    ///
    /// The current revision map replaces the persisted one only if `success`
    /// is true, the source has tracking and no storage-level error occurred.
    /// Returns whether a map was committed.
    ///
    /// # Errors
    ///
    /// Returns an error if the revision map cannot be saved or the backend
    /// cannot be closed. The backend is closed in either case.
    pub fn end_sync(&mut self, success: bool) -> SourceResult<bool> {
        let commit = success && self.storage_failure.is_none() && self.open;

        let saved = match (&mut self.tracking, commit) {
            (Some(tracking), true) => {
                let map = tracking.commit_map(&self.current);
                let result = tracking.store.save(&map);
                if result.is_ok() {
                    info!(
                        source = self.backend.name(),
                        items = map.len(),
                        failed = tracking.failed.len(),
                        "revisions committed"
                    );
                    tracking.previous = map;
                }
                result.map(|()| true)
            }
            (Some(_), false) => {
                info!(source = self.backend.name(), "keeping previous revisions");
                Ok(false)
            }
            (None, _) => Ok(false),
        };

        let closed = if self.open {
            self.open = false;
            self.backend.close()
        } else {
            Ok(())
        };

        if let Err(err) = &saved {
            self.note_failure(err);
        }
        let committed = saved?;
        closed?;
        Ok(committed)
    }

    fn check_open(&self) -> SourceResult<()> {
        if let Some(reason) = &self.storage_failure {
            return Err(SourceError::fatal(self.backend.name(), reason.clone()));
        }
        if !self.open {
            return Err(SourceError::NotOpen(self.backend.name().to_string()));
        }
        Ok(())
    }

    fn observe<T>(&mut self, result: SourceResult<T>) -> SourceResult<T> {
        if let Err(err) = &result {
            self.note_failure(err);
        }
        result
    }

    fn note_failure(&mut self, err: &SourceError) {
        if err.is_storage_failure() && self.storage_failure.is_none() {
            self.fail(err.to_string());
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.backend.name())
            .field("mode", &self.mode)
            .field("tracking", &self.tracking.is_some())
            .field("items", &self.current.len())
            .field("open", &self.open)
            .finish()
    }
}
