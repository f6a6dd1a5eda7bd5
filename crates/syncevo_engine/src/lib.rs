//! # SyncEvolution Engine
//!
//! Session driver for SyncML synchronization.
//!
//! This crate provides:
//! - Session configuration read from config nodes ([`SyncConfig`])
//! - The seam to the SyncML protocol engine ([`ProtocolEngine`], [`ItemStore`])
//! - The session driver ([`SyncEngineDriver`]) with message retry
//! - Suspend and abort of running sessions ([`SessionRegistry`], [`SessionHandle`])
//! - Session reports with SyncEvolution status codes
//! - Transport selection by URL and local sync setup
//!
//! ## Session
//!
//! 1. Every enabled source is opened and its changes since the last
//!    successful session are detected
//! 2. The protocol engine turns changes into messages and applies the
//!    peer's changes through the [`ItemStore`]
//! 3. Failed sends are repeated every `RetryInterval` until
//!    `RetryDuration` has passed since the first attempt
//! 4. Sources that completed commit their revision maps
//!
//! ## Key Invariants
//!
//! - One item failing does not fail the session
//! - A source with a storage failure keeps its previous revision map
//! - Suspended, aborted and failed sessions commit nothing
//! - One session per configuration name at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod driver;
mod error;
mod factory;
mod local;
mod protocol;
mod registry;
mod report;

pub use config::{RetryConfig, SourceConfig, SyncConfig, ASK_PASSWORD, LOCAL_SYNC_HELPER};
pub use driver::{DriverState, DriverStats, SyncEngineDriver};
pub use error::{SyncError, SyncResult};
pub use factory::{create_agent, create_agent_with};
pub use local::{local_sync_request, parse_local_url, LOCAL_SCHEME, TARGET_CONFIG};
pub use protocol::{
    ItemStatus, ItemStore, ProtocolEngine, SessionEnd, SessionInfo, SourceOffer, StepCommand,
    StepInput,
};
pub use registry::{SessionGuard, SessionHandle, SessionRegistry, SessionRequest, ABORT_WINDOW};
pub use report::{ChangeCounts, ItemError, SourceReport, SyncReport, SyncStatus};
