//! Directory-backed reference backend.

use crate::allocator::ItemIdAllocator;
use crate::backend::{InsertItemResult, SyncSource};
use crate::error::{SourceError, SourceResult};
use crate::types::{Luid, Revision, RevisionMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Stores each item in its own file inside one directory.
///
/// - File name = LUID (decimal numbers for items created here)
/// - Revision = modification time in nanoseconds since the epoch
///
/// Hidden files (leading `.`) are ignored. The directory is created on
/// [`SyncSource::open`] if missing.
#[derive(Debug)]
pub struct FileSyncSource {
    name: String,
    dir: PathBuf,
    mime_type: String,
    allocator: ItemIdAllocator,
    open: bool,
}

impl FileSyncSource {
    /// Creates a source for the items in `dir`.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            mime_type: "text/plain".to_string(),
            allocator: ItemIdAllocator::default(),
            open: false,
        }
    }

    /// Sets the MIME type reported for the items.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Returns the item directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_open(&self) -> SourceResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(SourceError::NotOpen(self.name.clone()))
        }
    }

    fn item_path(&self, luid: &Luid) -> SourceResult<PathBuf> {
        let id = luid.as_str();
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(SourceError::InvalidItem {
                luid: luid.clone(),
                message: "not usable as file name".to_string(),
            });
        }
        Ok(self.dir.join(id))
    }

    /// Claims a new file with a fresh LUID.
    ///
    /// `create_new` fails if another writer created the same file since the
    /// allocator was seeded; the next ID is tried then.
    fn create_item_file(&mut self) -> SourceResult<(Luid, File)> {
        loop {
            let luid = self.allocator.allocate()?;
            let path = self.dir.join(luid.as_str());
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((luid, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(source = %self.name, %luid, "item file already exists, trying next ID");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn revision_of(path: &Path) -> SourceResult<Revision> {
    let modified = fs::metadata(path)?.modified()?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    Ok(Revision::new(nanos.to_string()))
}

fn not_found(err: io::Error, luid: &Luid) -> SourceError {
    if err.kind() == io::ErrorKind::NotFound {
        SourceError::NotFound(luid.clone())
    } else {
        SourceError::Io(err)
    }
}

impl SyncSource for FileSyncSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> SourceResult<()> {
        fs::create_dir_all(&self.dir)?;
        self.open = true;
        let items = self.list_all_items()?;
        self.allocator = ItemIdAllocator::seeded(items.luids());
        debug!(
            source = %self.name,
            dir = %self.dir.display(),
            items = items.len(),
            next_id = ?self.allocator.peek(),
            "file source opened"
        );
        Ok(())
    }

    fn close(&mut self) -> SourceResult<()> {
        self.open = false;
        Ok(())
    }

    fn list_all_items(&mut self) -> SourceResult<RevisionMap> {
        self.check_open()?;
        let mut items = RevisionMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let revision = revision_of(&entry.path())?;
            items.insert(name, revision);
        }
        Ok(items)
    }

    fn read_item(&mut self, luid: &Luid) -> SourceResult<Vec<u8>> {
        self.check_open()?;
        let path = self.item_path(luid)?;
        fs::read(path).map_err(|err| not_found(err, luid))
    }

    fn insert_item(&mut self, luid: Option<&Luid>, data: &[u8]) -> SourceResult<InsertItemResult> {
        self.check_open()?;
        let (luid, path, was_update) = match luid {
            Some(luid) => {
                let path = self.item_path(luid)?;
                let existed = path.is_file();
                fs::write(&path, data)?;
                self.allocator.observe(luid);
                (luid.clone(), path, existed)
            }
            None => {
                let (luid, mut file) = self.create_item_file()?;
                file.write_all(data)?;
                file.sync_all()?;
                let path = self.dir.join(luid.as_str());
                (luid, path, false)
            }
        };
        let revision = revision_of(&path)?;
        debug!(source = %self.name, %luid, %revision, was_update, "item stored");
        Ok(InsertItemResult::new(luid, revision, was_update))
    }

    fn remove_item(&mut self, luid: &Luid) -> SourceResult<()> {
        self.check_open()?;
        let path = self.item_path(luid)?;
        fs::remove_file(path).map_err(|err| not_found(err, luid))?;
        debug!(source = %self.name, %luid, "item removed");
        Ok(())
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }
}
