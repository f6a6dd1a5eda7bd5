//! # SyncEvolution Storage
//!
//! Persistent key/value nodes backing change tracking and configuration.
//!
//! This crate provides the lowest-level persistence abstraction. Nodes are
//! **opaque property stores** - they do not interpret the strings they hold.
//! The change tracking layer stores one property per item (LUID as key,
//! revision string as value); the configuration layer stores one property per
//! setting.
//!
//! ## Design Principles
//!
//! - Nodes are simple string maps (get, set, replace, flush)
//! - Replacing the whole content is atomic
//! - A persistent node is owned by exactly one session at a time
//!
//! ## Available Nodes
//!
//! - [`InMemoryNode`] - For testing and volatile state
//! - [`FileNode`] - For persistent state in an INI-like file
//!
//! ## Example
//!
//! ```rust
//! use syncevo_storage::{ConfigNode, InMemoryNode, NodeExt};
//!
//! let mut node = InMemoryNode::new("config");
//! node.set_property("RetryInterval", "2m").unwrap();
//! let interval = node.get_duration("RetryInterval").unwrap();
//! assert_eq!(interval, Some(std::time::Duration::from_secs(120)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod node;
mod typed;

pub use error::{StorageError, StorageResult};
pub use file::FileNode;
pub use memory::InMemoryNode;
pub use node::ConfigNode;
pub use typed::{parse_duration, NodeExt};
