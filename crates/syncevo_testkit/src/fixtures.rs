//! Test fixtures.
//!
//! Provides sources on temporary directories, session configurations with
//! short retry times and scripted replies.

use crate::backend::MemoryBackend;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use syncevo_engine::{RetryConfig, SyncConfig};
use syncevo_source::{FileSyncSource, RevisionStore, Source};
use syncevo_storage::{FileNode, InMemoryNode};
use syncevo_transport::{content_type, MockResponse, TransportMessage};
use tempfile::TempDir;

/// Installs a `tracing` subscriber writing to the test output.
///
/// The filter comes from `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A directory-backed source with its tracking node, cleaned up on drop.
pub struct FileSourceFixture {
    name: String,
    _temp_dir: TempDir,
    items: PathBuf,
    tracking: PathBuf,
}

impl FileSourceFixture {
    /// Creates an empty item directory.
    pub fn new(name: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let items = temp_dir.path().join("items");
        std::fs::create_dir_all(&items).expect("Failed to create item directory");
        let tracking = temp_dir.path().join("tracking").join(format!("{name}.ini"));
        Self {
            name: name.to_string(),
            _temp_dir: temp_dir,
            items,
            tracking,
        }
    }

    /// Returns the item directory.
    pub fn items(&self) -> &Path {
        &self.items
    }

    /// Returns the path of the tracking node.
    pub fn tracking(&self) -> &Path {
        &self.tracking
    }

    /// Writes an item file as a local edit would.
    pub fn write_item(&self, luid: &str, data: impl AsRef<[u8]>) {
        std::fs::write(self.items.join(luid), data).expect("Failed to write item");
    }

    /// Removes an item file.
    pub fn remove_item(&self, luid: &str) {
        std::fs::remove_file(self.items.join(luid)).expect("Failed to remove item");
    }

    /// Opens the source with revision tracking. Only one source may be open
    /// at a time, the tracking node is locked.
    pub fn source(&self) -> Source {
        let node = FileNode::open_with_create_dirs(&self.tracking)
            .expect("Failed to open tracking node");
        Source::with_tracking(
            FileSyncSource::new(self.name.clone(), self.items.clone()),
            RevisionStore::new(node),
        )
    }
}

/// Wraps `backend` in a source tracked in `node`.
pub fn memory_source(backend: &MemoryBackend, node: &InMemoryNode) -> Source {
    Source::with_tracking(backend.clone(), RevisionStore::new(node.clone()))
}

/// Retry settings for tests: resend after 20ms for at most 2s.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new(Duration::from_secs(2), Duration::from_millis(20))
}

/// Creates an XML configuration with fast retry for `sources`, all
/// two-way.
pub fn test_config(name: &str, sources: &[&str]) -> SyncConfig {
    let mut config = SyncConfig::new(name, "http://localhost/sync")
        .with_wbxml(false)
        .with_retry(fast_retry());
    for source in sources {
        config = config.with_source(*source, Default::default());
    }
    config
}

/// A scripted reply with `body`.
pub fn reply(body: &str) -> MockResponse {
    MockResponse::Reply(TransportMessage::new(
        body.as_bytes().to_vec(),
        content_type::SYNCML_XML,
    ))
}

/// `count` empty replies.
pub fn replies(count: usize) -> Vec<MockResponse> {
    (0..count).map(|_| reply("")).collect()
}
