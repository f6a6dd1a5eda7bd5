//! Transport selection by URL scheme.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::local::{local_sync_request, parse_local_url, LOCAL_SCHEME};
use std::sync::Arc;
use syncevo_transport::local::{ChildSpawner, ProcessSpawner, StartSync};
use syncevo_transport::{
    HttpTransportAgent, LocalTransportAgent, ObexTransportAgent, TransportAgent, UserInterface,
};
use tracing::debug;

/// Creates the transport agent for `config.sync_url`:
///
/// - `http://`, `https://`: HTTP with the configured proxy and TLS settings
/// - `obex-bt://`, `obex-tcp://`: OBEX
/// - `local://@context`: a `config.local_sync_helper` child started with
///   the target configuration as argument; its password requests go to `ui`
///
/// # Errors
///
/// Returns [`SyncError::Config`] for an unsupported scheme, or the error of
/// the agent rejecting its settings.
pub fn create_agent(
    config: &SyncConfig,
    ui: Arc<dyn UserInterface>,
) -> SyncResult<Box<dyn TransportAgent>> {
    let helper = config.local_sync_helper.clone();
    create_agent_with(config, ui, move |start| {
        ProcessSpawner::new(helper).arg(start.config.clone())
    })
}

/// Like [`create_agent`], with the child of a `local://` sync started by the
/// spawner `local_spawner` returns for the child's start request.
///
/// `local_spawner` is only called for `local://` URLs.
///
/// # Errors
///
/// Returns [`SyncError::Config`] for an unsupported scheme, or the error of
/// the agent rejecting its settings.
pub fn create_agent_with<S, F>(
    config: &SyncConfig,
    ui: Arc<dyn UserInterface>,
    local_spawner: F,
) -> SyncResult<Box<dyn TransportAgent>>
where
    S: ChildSpawner + 'static,
    F: FnOnce(&StartSync) -> S,
{
    let url = config.sync_url.as_str();
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default();

    let mut agent: Box<dyn TransportAgent> = match scheme.as_str() {
        "http" | "https" => {
            let mut agent = HttpTransportAgent::with_ssl(config.ssl.clone())?;
            if let Some(proxy) = config.effective_proxy() {
                agent.set_proxy(&proxy.url);
                if let (Some(user), Some(password)) = (&proxy.username, &proxy.password) {
                    agent.set_proxy_auth(user, password);
                }
            }
            Box::new(agent)
        }
        "obex-bt" | "obex-tcp" => Box::new(ObexTransportAgent::new()?),
        _ if url.starts_with(LOCAL_SCHEME) => {
            let context = parse_local_url(url)?;
            let start = local_sync_request(config, &context);
            let spawner = local_spawner(&start);
            Box::new(LocalTransportAgent::new(spawner, start)?.with_ui(ui))
        }
        _ => {
            return Err(SyncError::Config(format!(
                "{url}: unsupported sync URL, expected http(s)://, obex-bt://, obex-tcp:// or local://"
            )))
        }
    };
    agent.set_url(url)?;
    debug!(url, "transport agent created");
    Ok(agent)
}
