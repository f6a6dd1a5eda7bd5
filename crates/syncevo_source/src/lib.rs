//! # SyncEvolution Sources
//!
//! Change tracking for the data stores items are synchronized with.
//!
//! This crate provides:
//! - The [`SyncSource`] trait backends implement
//! - Revision-based change detection ([`compute_changes`])
//! - Persistence of revision maps between sessions ([`RevisionStore`])
//! - Allocation of local item IDs ([`ItemIdAllocator`])
//! - [`Source`], a backend composed with optional [`RevisionTracking`]
//! - [`FileSyncSource`], a directory-backed reference backend
//!
//! ## Change detection
//!
//! Every session enumerates all items with their revisions and compares the
//! result against the map persisted by the last successful session. Items
//! only present now are added, items only present then are deleted, items
//! whose revision differs are updated.
//!
//! ## Commit policy
//!
//! The revision map of a source is committed once per session, at
//! [`Source::end_sync`], and only if the session succeeded. Items whose
//! processing failed keep their previous revision so that they are detected
//! as changed again.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod allocator;
mod backend;
mod detector;
mod error;
mod file_source;
mod mode;
mod source;
mod store;
mod types;

pub use allocator::ItemIdAllocator;
pub use backend::{InsertItemResult, InsertState, SyncSource};
pub use detector::compute_changes;
pub use error::{SourceError, SourceResult};
pub use file_source::FileSyncSource;
pub use mode::{SyncMode, UnknownSyncMode};
pub use source::{RevisionTracking, Source};
pub use store::RevisionStore;
pub use types::{ChangeSet, ItemState, Luid, Revision, RevisionMap};
