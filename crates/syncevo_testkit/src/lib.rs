//! # SyncEvolution Testkit
//!
//! Test utilities for SyncEvolution.
//!
//! This crate provides:
//! - An in-memory backend with failure injection ([`MemoryBackend`])
//! - A scripted protocol engine acting as the peer ([`ScriptedEngine`])
//! - Property-based generators for revision maps
//! - Fixtures for file-backed sources and test logging
//!
//! ## Usage
//!
//! ```rust,ignore
//! use syncevo_testkit::prelude::*;
//!
//! #[test]
//! fn sync_with_failing_item() {
//!     let backend = MemoryBackend::new("calendar").with_item("1", "BEGIN:VEVENT");
//!     backend.fail_insert("1");
//!     let mut sources = vec![memory_source(&backend, &InMemoryNode::new("tracking"))];
//!     // ... run a session
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod engine;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::engine::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use syncevo_storage::InMemoryNode;
}

pub use backend::*;
pub use engine::*;
pub use fixtures::*;
pub use generators::*;
