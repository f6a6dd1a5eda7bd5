//! File-based tracking node for persistent storage.
//!
//! The file layout is a flat INI-like list of `key = value` lines:
//!
//! ```text
//! # change tracking for "addressbook"
//! 1 = 1700000000123456789
//! 2 = 1700000000987654321
//! ```
//!
//! Keys and values are escaped with `!XX` hex sequences where the raw text
//! would be ambiguous (`=`, `!`, line breaks, comment markers, surrounding
//! whitespace), so any string survives a write/read cycle.

use crate::error::{StorageError, StorageResult};
use crate::node::ConfigNode;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Suffix of the advisory lock file next to the node file.
const LOCK_SUFFIX: &str = ".lock";

/// A file-based tracking node.
///
/// Properties are cached in memory; [`ConfigNode::flush`] and
/// [`ConfigNode::replace_all`] write the complete content to a temporary
/// file, sync it and atomically rename it over the node file.
///
/// # Exclusive access
///
/// The node holds an exclusive advisory lock on `<file>.lock` for as long as
/// it is open. Opening the same node twice fails with
/// [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use syncevo_storage::{ConfigNode, FileNode};
/// use std::path::Path;
///
/// let mut node = FileNode::open(Path::new("tracking.ini")).unwrap();
/// node.set_property("1", "1700000000").unwrap();
/// node.flush().unwrap(); // Ensure data is durable
/// ```
#[derive(Debug)]
pub struct FileNode {
    path: PathBuf,
    name: String,
    properties: BTreeMap<String, String>,
    dirty: bool,
    exists: bool,
    _lock_file: File,
}

impl FileNode {
    /// Opens the node at `path`, reading its content if the file exists.
    ///
    /// A missing file is not an error; the node starts empty and the file
    /// is created by the first flush.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another `FileNode` holds the lock (`Locked`)
    /// - The file exists but cannot be parsed (`Corrupted`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> StorageResult<Self> {
        let lock_path = lock_path_for(path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.to_path_buf()));
        }

        let (properties, exists) = match fs::read_to_string(path) {
            Ok(text) => (parse(path, &text)?, true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (BTreeMap::new(), false),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            name: path.display().to_string(),
            properties,
            dirty: false,
            exists,
            _lock_file: lock_file,
        })
    }

    /// Opens the node, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the node cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the node file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, properties: &BTreeMap<String, String>) -> StorageResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut temp = NamedTempFile::new_in(&dir)?;
        temp.write_all(render(properties).as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| StorageError::Io(e.error))?;

        sync_directory(&dir)?;
        debug!(node = %self.name, entries = properties.len(), "node written");
        Ok(())
    }
}

impl ConfigNode for FileNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_property(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.properties.get(key).cloned())
    }

    fn set_property(&mut self, key: &str, value: &str) -> StorageResult<()> {
        if self.properties.get(key).map(String::as_str) != Some(value) {
            self.properties.insert(key.to_string(), value.to_string());
            self.dirty = true;
        }
        Ok(())
    }

    fn remove_property(&mut self, key: &str) -> StorageResult<()> {
        if self.properties.remove(key).is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    fn read_properties(&self) -> StorageResult<BTreeMap<String, String>> {
        Ok(self.properties.clone())
    }

    fn replace_all(&mut self, properties: BTreeMap<String, String>) -> StorageResult<()> {
        // Disk first: on failure the cached content still matches the file.
        self.write_file(&properties)?;
        self.properties = properties;
        self.dirty = false;
        self.exists = true;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn flush(&mut self) -> StorageResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.write_file(&self.properties)?;
        self.dirty = false;
        self.exists = true;
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

fn render(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        out.push_str(&escape(key, true));
        out.push_str(" = ");
        out.push_str(&escape(value, false));
        out.push('\n');
    }
    out
}

fn parse(path: &Path, text: &str) -> StorageResult<BTreeMap<String, String>> {
    let mut properties = BTreeMap::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let corrupted = |message: &str| StorageError::Corrupted {
            path: path.to_path_buf(),
            line: index + 1,
            message: message.to_string(),
        };

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| corrupted("missing '='"))?;
        let key = unescape(key.trim()).ok_or_else(|| corrupted("bad escape in key"))?;
        let value = unescape(value.trim()).ok_or_else(|| corrupted("bad escape in value"))?;
        properties.insert(key, value);
    }

    Ok(properties)
}

fn needs_escape(c: char, index: usize, last: usize, is_key: bool) -> bool {
    match c {
        '!' | '\n' | '\r' => true,
        '=' => is_key,
        '#' => index == 0,
        c if c.is_whitespace() => index == 0 || index == last,
        _ => false,
    }
}

fn escape(text: &str, is_key: bool) -> String {
    let count = text.chars().count();
    let last = count.saturating_sub(1);
    let mut out = String::with_capacity(text.len());

    for (index, c) in text.chars().enumerate() {
        if needs_escape(c, index, last, is_key) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("!{byte:02x}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn unescape(text: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(text.len());
    let raw = text.as_bytes();
    let mut i = 0;

    while i < raw.len() {
        if raw[i] == b'!' {
            let hex = text.get(i + 1..i + 3)?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }

    String::from_utf8(bytes).ok()
}
