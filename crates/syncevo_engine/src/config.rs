//! Configuration for sync sessions.

use crate::error::{SyncError, SyncResult};
use std::path::PathBuf;
use std::time::Duration;
use syncevo_source::SyncMode;
use syncevo_storage::{ConfigNode, NodeExt, StorageError};
use syncevo_transport::{content_type, PasswordKey, ProxyConfig, SslConfig, UserInterface};
use tracing::debug;

/// Password value meaning "ask the user".
pub const ASK_PASSWORD: &str = "-";

/// Default program running the child side of a local sync, looked up in
/// `PATH`.
pub const LOCAL_SYNC_HELPER: &str = "syncevo-local-sync";

/// Per-source settings of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Source name.
    pub name: String,
    /// Requested sync mode.
    pub mode: SyncMode,
}

impl SourceConfig {
    /// Creates source settings.
    pub fn new(name: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            name: name.into(),
            mode,
        }
    }

    /// Reads the `sync` property of a source node. A missing property means
    /// two-way.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be read or the mode is unknown.
    pub fn from_node(name: impl Into<String>, node: &dyn ConfigNode) -> SyncResult<Self> {
        let mode = match node.get_string("sync")? {
            Some(value) => value.parse().map_err(|_: syncevo_source::UnknownSyncMode| {
                StorageError::InvalidValue {
                    key: "sync".to_string(),
                    value: value.clone(),
                    expected: "sync mode",
                }
            })?,
            None => SyncMode::TwoWay,
        };
        Ok(Self::new(name, mode))
    }
}

/// Configuration for one peer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Configuration name, used to register the session.
    pub config_name: String,
    /// Peer address: `http(s)://`, `obex-bt://`, `obex-tcp://` or
    /// `local://@context`.
    pub sync_url: String,
    /// User name at the peer.
    pub username: String,
    /// Password at the peer, [`ASK_PASSWORD`] to ask the user.
    pub password: String,
    /// Proxy settings, used if `use_proxy` is set.
    pub proxy: Option<ProxyConfig>,
    /// Whether HTTP requests go through `proxy`.
    pub use_proxy: bool,
    /// TLS settings.
    pub ssl: SslConfig,
    /// Whether messages use WBXML instead of XML.
    pub wbxml: bool,
    /// Resend policy.
    pub retry: RetryConfig,
    /// Active sources.
    pub sources: Vec<SourceConfig>,
    /// Program started as the peer of a `local://` sync.
    pub local_sync_helper: PathBuf,
}

impl SyncConfig {
    /// Creates a configuration for `sync_url` with default settings.
    pub fn new(config_name: impl Into<String>, sync_url: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            sync_url: sync_url.into(),
            username: String::new(),
            password: String::new(),
            proxy: None,
            use_proxy: false,
            ssl: SslConfig::default(),
            wbxml: true,
            retry: RetryConfig::default(),
            sources: Vec::new(),
            local_sync_helper: PathBuf::from(LOCAL_SYNC_HELPER),
        }
    }

    /// Reads a configuration from its properties.
    ///
    /// The node name becomes the configuration name.
    ///
    /// # Errors
    ///
    /// Returns an error if a property cannot be read or parsed.
    pub fn from_node(node: &dyn ConfigNode) -> SyncResult<Self> {
        let mut config = Self::new(node.name(), node.get_string("syncURL")?.unwrap_or_default());
        config.username = node.get_string("username")?.unwrap_or_default();
        config.password = node.get_string("password")?.unwrap_or_default();
        config.use_proxy = node.get_bool("useProxy")?.unwrap_or(false);
        if let Some(host) = node.get_string("proxyHost")? {
            let mut proxy = ProxyConfig::new(host);
            if let Some(user) = node.get_string("proxyUsername")? {
                let password = node.get_string("proxyPassword")?.unwrap_or_default();
                proxy = proxy.with_auth(user, password);
            }
            config.proxy = Some(proxy);
        }
        if let Some(verify) = node.get_bool("SSLVerifyServer")? {
            config.ssl.verify_server = verify;
        }
        if let Some(certificates) = node.get_string("SSLServerCertificates")? {
            config.ssl.ca_certificates = certificates
                .split(':')
                .filter(|path| !path.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(wbxml) = node.get_bool("WBXML")? {
            config.wbxml = wbxml;
        }
        if let Some(duration) = node.get_duration("RetryDuration")? {
            config.retry.retry_duration = duration;
        }
        if let Some(interval) = node.get_duration("RetryInterval")? {
            config.retry.retry_interval = interval;
        }
        debug!(config = %config.config_name, url = %config.sync_url, "configuration loaded");
        Ok(config)
    }

    /// Sets the credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets and enables the proxy.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self.use_proxy = true;
        self
    }

    /// Sets the TLS settings.
    pub fn with_ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = ssl;
        self
    }

    /// Selects WBXML or XML encoding.
    pub fn with_wbxml(mut self, wbxml: bool) -> Self {
        self.wbxml = wbxml;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Adds an active source.
    pub fn with_source(mut self, name: impl Into<String>, mode: SyncMode) -> Self {
        self.sources.push(SourceConfig::new(name, mode));
        self
    }

    /// Sets the program started as the peer of a `local://` sync.
    pub fn with_local_sync_helper(mut self, program: impl Into<PathBuf>) -> Self {
        self.local_sync_helper = program.into();
        self
    }

    /// Returns the configured mode of a source, two-way if it is not listed.
    pub fn mode_for(&self, source: &str) -> SyncMode {
        self.sources
            .iter()
            .find(|s| s.name == source)
            .map_or(SyncMode::TwoWay, |s| s.mode)
    }

    /// Returns the MIME type of outgoing messages.
    pub fn content_type(&self) -> &'static str {
        if self.wbxml {
            content_type::SYNCML_WBXML
        } else {
            content_type::SYNCML_XML
        }
    }

    /// Returns the proxy to use, if any.
    pub fn effective_proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref().filter(|_| self.use_proxy)
    }

    /// Returns the password, asking `ui` if it is configured as
    /// [`ASK_PASSWORD`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AuthenticationFailed`] if the user declines.
    pub fn resolve_password(&self, ui: &dyn UserInterface) -> SyncResult<String> {
        if self.password != ASK_PASSWORD {
            return Ok(self.password.clone());
        }
        let key = PasswordKey::for_url(self.username.clone(), &self.sync_url);
        let description = format!("{} account '{}'", self.config_name, self.username);
        ui.ask_password("password", &description, &key).ok_or_else(|| {
            SyncError::AuthenticationFailed(format!("no password for {}", self.config_name))
        })
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Resend policy for unanswered messages.
///
/// A message without reply after `retry_interval` is sent again, as is a
/// message whose transfer failed, once `retry_interval` has passed since it
/// was sent. Resending stops when `retry_duration` has passed since the
/// first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total time for resending one message. Zero disables resending.
    pub retry_duration: Duration,
    /// Time between attempts and per-message deadline. Zero disables the
    /// deadline.
    pub retry_interval: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(retry_duration: Duration, retry_interval: Duration) -> Self {
        Self {
            retry_duration,
            retry_interval,
        }
    }

    /// Creates a configuration that never resends.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Sets the total retry time.
    pub fn with_retry_duration(mut self, duration: Duration) -> Self {
        self.retry_duration = duration;
        self
    }

    /// Sets the interval between attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Returns the per-message deadline.
    pub fn message_timeout(&self) -> Option<Duration> {
        (!self.retry_interval.is_zero()).then_some(self.retry_interval)
    }

    /// Returns true if a message first sent `elapsed` ago may still be
    /// resent.
    pub fn allows_retry(&self, elapsed: Duration) -> bool {
        !self.retry_duration.is_zero() && elapsed < self.retry_duration
    }

    /// Returns how long to wait before resending a message whose last
    /// attempt started `since_send` ago.
    pub fn delay_before_resend(&self, since_send: Duration) -> Duration {
        self.retry_interval.saturating_sub(since_send)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60), Duration::from_secs(2 * 60))
    }
}
