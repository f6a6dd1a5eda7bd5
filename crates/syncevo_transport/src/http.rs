//! HTTP(S) transport.
//!
//! Each message is one POST request; the response body is the reply. The
//! actual HTTP client is abstracted via [`HttpClient`] so that tests and
//! embedders can route requests without a network.

use crate::agent::{
    AgentCore, CancelHandle, Outcome, TransportAgent, TransportMessage, TransportStatus,
};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// User agent sent with every request.
pub const USER_AGENT: &str = "SyncEvolution";

/// Proxy settings for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `http://proxy:8080`.
    pub url: String,
    /// Proxy user name.
    pub username: Option<String>,
    /// Proxy password.
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Creates proxy settings without credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Sets the proxy credentials.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// TLS settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslConfig {
    /// Whether the server certificate must be valid.
    pub verify_server: bool,
    /// PEM files with additional trusted root certificates.
    pub ca_certificates: Vec<PathBuf>,
}

impl SslConfig {
    /// Sets whether the server certificate is verified.
    pub fn with_verify_server(mut self, verify: bool) -> Self {
        self.verify_server = verify;
        self
    }

    /// Adds a PEM file with trusted root certificates.
    pub fn with_ca_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certificates.push(path.into());
        self
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            verify_server: true,
            ca_certificates: Vec::new(),
        }
    }
}

/// One POST request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Target URL.
    pub url: String,
    /// Value of the `Content-Type` header.
    pub content_type: String,
    /// Request body.
    pub body: Bytes,
    /// Proxy to use, if any.
    pub proxy: Option<ProxyConfig>,
}

/// Response to an [`HttpRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Value of the `Content-Type` header, if present.
    pub content_type: Option<String>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a 200 response.
    pub fn ok(body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.into()),
            body: body.into(),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response.
    ///
    /// Non-200 responses are returned as responses, not as errors.
    async fn post(&self, request: HttpRequest) -> TransportResult<HttpResponse>;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    async fn post(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        (**self).post(request).await
    }
}

/// [`HttpClient`] backed by `reqwest` with rustls.
pub struct ReqwestClient {
    ssl: SslConfig,
    certificates: Vec<reqwest::Certificate>,
    clients: Mutex<Option<(Option<ProxyConfig>, reqwest::Client)>>,
}

impl ReqwestClient {
    /// Creates a client with the given TLS settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate file cannot be read or parsed.
    pub fn new(ssl: SslConfig) -> TransportResult<Self> {
        let mut certificates = Vec::with_capacity(ssl.ca_certificates.len());
        for path in &ssl.ca_certificates {
            let pem = std::fs::read(path)?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                TransportError::Http(format!("certificate {}: {err}", path.display()))
            })?;
            certificates.push(certificate);
        }
        Ok(Self {
            ssl,
            certificates,
            clients: Mutex::new(None),
        })
    }

    /// Returns a client for `proxy`, reusing the last one if the proxy is
    /// unchanged.
    fn client_for(&self, proxy: Option<&ProxyConfig>) -> TransportResult<reqwest::Client> {
        let mut cached = self.clients.lock();
        if let Some((cached_proxy, client)) = cached.as_ref() {
            if cached_proxy.as_ref() == proxy {
                return Ok(client.clone());
            }
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(!self.ssl.verify_server);
        for certificate in &self.certificates {
            builder = builder.add_root_certificate(certificate.clone());
        }
        builder = match proxy {
            Some(proxy) => {
                let mut settings = reqwest::Proxy::all(proxy.url.as_str())?;
                if let Some(user) = &proxy.username {
                    settings = settings.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
                }
                builder.proxy(settings)
            }
            None => builder.no_proxy(),
        };

        let client = builder.build()?;
        *cached = Some((proxy.cloned(), client.clone()));
        Ok(client)
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        let client = self.client_for(request.proxy.as_ref())?;
        let response = client
            .post(request.url.as_str())
            .header(reqwest::header::CONTENT_TYPE, request.content_type)
            .body(request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

impl std::fmt::Debug for ReqwestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestClient")
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response.
    fn handle_post(&self, request: &HttpRequest) -> HttpResponse;
}

impl<F> LoopbackServer for F
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync,
{
    fn handle_post(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

/// A loopback HTTP client that routes requests directly to an in-process
/// server. Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        Ok(self.server.handle_post(&request))
    }
}

/// Transport agent speaking SyncML over HTTP(S).
pub struct HttpTransportAgent<C: HttpClient = ReqwestClient> {
    core: AgentCore,
    client: C,
    proxy: Option<ProxyConfig>,
    pending: Option<HttpRequest>,
}

impl HttpTransportAgent<ReqwestClient> {
    /// Creates an agent using `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS settings are unusable or the I/O runtime
    /// cannot be created.
    pub fn with_ssl(ssl: SslConfig) -> TransportResult<Self> {
        Self::new(ReqwestClient::new(ssl)?)
    }
}

impl<C: HttpClient> HttpTransportAgent<C> {
    /// Creates an agent using `client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the I/O runtime cannot be created.
    pub fn new(client: C) -> TransportResult<Self> {
        Ok(Self {
            core: AgentCore::new("http")?,
            client,
            proxy: None,
            pending: None,
        })
    }

    /// Returns the configured URL.
    pub fn url(&self) -> Option<&str> {
        self.core.url.as_deref()
    }

    /// Returns the configured proxy.
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }
}

impl<C: HttpClient> TransportAgent for HttpTransportAgent<C> {
    fn set_url(&mut self, url: &str) -> TransportResult<()> {
        let lower = url.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Err(TransportError::invalid_url(url, "expected http:// or https://"));
        }
        self.core.url = Some(url.to_string());
        Ok(())
    }

    fn set_proxy(&mut self, proxy: &str) {
        if proxy.is_empty() {
            self.proxy = None;
            return;
        }
        let auth = self.proxy.take().filter(|old| old.username.is_some());
        let mut config = ProxyConfig::new(proxy);
        if let Some(old) = auth {
            config.username = old.username;
            config.password = old.password;
        }
        self.proxy = Some(config);
    }

    fn set_proxy_auth(&mut self, user: &str, password: &str) {
        if let Some(proxy) = &mut self.proxy {
            proxy.username = Some(user.to_string());
            proxy.password = Some(password.to_string());
        } else {
            debug!("proxy credentials set without proxy, ignored");
        }
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.core.content_type = content_type.to_string();
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.core.set_timeout(timeout);
    }

    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        self.core.begin_send(true, data.len())?;
        let url = self.core.url.clone().ok_or(TransportError::NoUrl)?;
        self.pending = Some(HttpRequest {
            url,
            content_type: self.core.content_type.clone(),
            body: Bytes::copy_from_slice(data),
            proxy: self.proxy.clone(),
        });
        Ok(())
    }

    fn cancel(&mut self) {
        if self.core.cancel() {
            self.pending = None;
        }
    }

    fn shutdown(&mut self) {
        self.pending = None;
        self.core.close();
    }

    fn wait(&mut self, no_reply: bool) -> TransportStatus {
        if self.core.status() != TransportStatus::Active {
            return self.core.status();
        }
        let Some(request) = self.pending.take() else {
            return self.core.finish(Outcome::Canceled);
        };
        let fallback_type = request.content_type.clone();

        let client = &self.client;
        let outcome = self.core.drive(async move {
            let response = client.post(request).await?;
            if response.status != 200 {
                return Err(TransportError::HttpStatus {
                    status: response.status,
                    reason: String::from_utf8_lossy(&response.body[..response.body.len().min(200)])
                        .into_owned(),
                });
            }
            if no_reply {
                return Ok(None);
            }
            let content_type = response.content_type.unwrap_or(fallback_type);
            Ok(Some(TransportMessage::new(response.body, content_type)))
        });
        self.core.finish(outcome)
    }

    fn get_reply(&self) -> TransportResult<&TransportMessage> {
        self.core.reply()
    }

    fn status(&self) -> TransportStatus {
        self.core.status()
    }

    fn last_error(&self) -> Option<&TransportError> {
        self.core.last_error()
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.core.cancel_handle()
    }
}
