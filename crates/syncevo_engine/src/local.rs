//! Sync between two configuration contexts on the same host.
//!
//! The peer is a child running the target configuration. It sees every
//! source from the other side, so its sync modes are inverted.

use crate::config::{SyncConfig, ASK_PASSWORD};
use crate::error::{SyncError, SyncResult};
use syncevo_transport::local::{SourceRequest, StartSync};

/// URL scheme of local sync.
pub const LOCAL_SCHEME: &str = "local://";

/// Name of the target configuration inside the peer context.
pub const TARGET_CONFIG: &str = "target-config";

/// Extracts the context from a `local://@context` URL.
///
/// # Errors
///
/// Returns [`SyncError::Config`] for other URLs or an empty context.
pub fn parse_local_url(url: &str) -> SyncResult<String> {
    let context = url
        .strip_prefix(LOCAL_SCHEME)
        .and_then(|rest| rest.strip_prefix('@'))
        .ok_or_else(|| SyncError::Config(format!("{url}: expected local://@<context>")))?;
    if context.is_empty() || context.contains(['/', '@']) {
        return Err(SyncError::Config(format!("{url}: invalid context '{context}'")));
    }
    Ok(context.to_string())
}

/// Builds the request that starts the child's side of a local sync in
/// `context`.
///
/// Disabled sources are left out; the others are requested with the mode
/// the child sees. A password still to be asked for is not passed on, the
/// child requests it through the parent's user interface.
pub fn local_sync_request(config: &SyncConfig, context: &str) -> StartSync {
    let sources = config
        .sources
        .iter()
        .filter(|source| source.mode.is_enabled())
        .map(|source| SourceRequest {
            name: source.name.clone(),
            mode: source.mode.inverted().as_str().to_string(),
        })
        .collect();

    StartSync {
        config: format!("{TARGET_CONFIG}@{context}"),
        parent_config: config.config_name.clone(),
        sources,
        username: config.username.clone(),
        password: if config.password == ASK_PASSWORD {
            String::new()
        } else {
            config.password.clone()
        },
    }
}
