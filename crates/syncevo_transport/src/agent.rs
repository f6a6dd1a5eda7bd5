//! The transport agent contract shared by all transports.

use crate::error::{TransportError, TransportResult};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// MIME types of SyncML messages.
pub mod content_type {
    /// SyncML in XML encoding.
    pub const SYNCML_XML: &str = "application/vnd.syncml+xml";
    /// SyncML in WBXML encoding.
    pub const SYNCML_WBXML: &str = "application/vnd.syncml+wbxml";
    /// Form data, used by some servers for the first message.
    pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
}

/// State of a transport agent.
///
/// ```text
/// Inactive --send()--> Active
/// Active   --reply---> GotReply
/// Active   --error---> Failed
/// Active   --cancel--> Canceled
/// Active   --timeout-> TimeOut
/// GotReply --send()--> Active
/// any      --shutdown> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// Nothing in flight.
    Inactive,
    /// A message was sent, the outcome is pending.
    Active,
    /// A reply was received and can be fetched with `get_reply()`.
    GotReply,
    /// The transfer was canceled.
    Canceled,
    /// The transfer failed, see `last_error()`.
    Failed,
    /// The agent was shut down.
    Closed,
    /// No reply arrived before the deadline.
    TimeOut,
}

impl TransportStatus {
    /// Returns true if `send()` may be called.
    pub fn can_send(&self) -> bool {
        !matches!(self, TransportStatus::Active | TransportStatus::Closed)
    }

    /// Returns true if resending after this status can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportStatus::Failed | TransportStatus::TimeOut)
    }
}

/// A message with its MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Message bytes, never interpreted by the transport.
    pub data: Bytes,
    /// MIME type of `data`.
    pub content_type: String,
}

impl TransportMessage {
    /// Creates a message.
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
        }
    }
}

/// Thread-safe trigger that cancels the transfer an agent is waiting for.
///
/// A signal handler sets a flag; code running on the main loop (or another
/// thread) calls [`CancelHandle::cancel`], which makes a blocked `wait()`
/// return [`TransportStatus::Canceled`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// Creates a handle that is not canceled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the current transfer.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns true if cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Clears a previous request. Called by agents when a new message is sent.
    pub fn reset(&self) {
        self.inner.canceled.store(false, Ordering::SeqCst);
    }

    /// Completes once cancellation is requested.
    pub async fn canceled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// Sends messages to a peer and receives its replies.
///
/// Exactly one message is in flight at a time: every `send()` must be
/// resolved by `wait()` (or `cancel()`) before the next one. Agents are
/// driven from a single thread; the only thing other threads may touch is
/// the [`CancelHandle`].
pub trait TransportAgent: Send {
    /// Sets the peer address used by the next `send()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not usable by this agent.
    fn set_url(&mut self, url: &str) -> TransportResult<()>;

    /// Sets an HTTP proxy. Agents without proxy support ignore it.
    fn set_proxy(&mut self, _proxy: &str) {}

    /// Sets proxy credentials. Agents without proxy support ignore them.
    fn set_proxy_auth(&mut self, _user: &str, _password: &str) {}

    /// Sets the MIME type of the next message.
    fn set_content_type(&mut self, content_type: &str);

    /// Sets the per-message deadline, measured from `send()`. `None` or a
    /// zero duration disables it.
    fn set_timeout(&mut self, timeout: Option<Duration>);

    /// Starts sending a message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Busy`] while a message is in flight,
    /// [`TransportError::Closed`] after `shutdown()` and
    /// [`TransportError::NoUrl`] if the agent needs an address.
    fn send(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Aborts the message in flight. A no-op if nothing is pending.
    fn cancel(&mut self);

    /// Releases the connection. The agent cannot be used afterwards.
    fn shutdown(&mut self);

    /// Runs the transfer until it resolves and returns the new status.
    ///
    /// With `no_reply` the outgoing message is delivered but no reply is
    /// awaited; the agent returns to [`TransportStatus::Inactive`].
    fn wait(&mut self, no_reply: bool) -> TransportStatus;

    /// Returns the reply. Only valid in [`TransportStatus::GotReply`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NoReply`] in every other state.
    fn get_reply(&self) -> TransportResult<&TransportMessage>;

    /// Returns the current status.
    fn status(&self) -> TransportStatus;

    /// Returns the error behind the last `Failed` or `TimeOut` status.
    fn last_error(&self) -> Option<&TransportError>;

    /// Returns a handle that cancels the transfer from another context.
    fn cancel_handle(&self) -> CancelHandle;
}

/// How a driven operation ended.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Completed(T),
    Failed(TransportError),
    Canceled,
    TimedOut,
}

/// State shared by all runtime-driven agents.
///
/// Each agent owns a current-thread runtime that only makes progress inside
/// `wait()`, so all I/O of one agent happens on the caller's thread.
pub(crate) struct AgentCore {
    kind: &'static str,
    runtime: Runtime,
    pub(crate) url: Option<String>,
    pub(crate) content_type: String,
    timeout: Option<Duration>,
    status: TransportStatus,
    deadline: Option<Instant>,
    reply: Option<TransportMessage>,
    last_error: Option<TransportError>,
    cancel: CancelHandle,
}

impl AgentCore {
    pub(crate) fn new(kind: &'static str) -> TransportResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            kind,
            runtime,
            url: None,
            content_type: content_type::SYNCML_XML.to_string(),
            timeout: None,
            status: TransportStatus::Inactive,
            deadline: None,
            reply: None,
            last_error: None,
            cancel: CancelHandle::new(),
        })
    }

    pub(crate) fn status(&self) -> TransportStatus {
        self.status
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|t| !t.is_zero());
    }

    pub(crate) fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub(crate) fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    pub(crate) fn reply(&self) -> TransportResult<&TransportMessage> {
        match (&self.status, &self.reply) {
            (TransportStatus::GotReply, Some(reply)) => Ok(reply),
            _ => Err(TransportError::NoReply(self.status)),
        }
    }

    /// Checks that a message may be sent and moves to `Active`.
    pub(crate) fn begin_send(&mut self, needs_url: bool, len: usize) -> TransportResult<()> {
        match self.status {
            TransportStatus::Closed => return Err(TransportError::Closed),
            TransportStatus::Active => return Err(TransportError::Busy),
            _ => {}
        }
        if needs_url && self.url.is_none() {
            return Err(TransportError::NoUrl);
        }

        self.cancel.reset();
        self.reply = None;
        self.last_error = None;
        self.deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        self.status = TransportStatus::Active;
        debug!(
            transport = self.kind,
            bytes = len,
            content_type = %self.content_type,
            timeout = ?self.timeout,
            "message sent"
        );
        Ok(())
    }

    /// Marks the transfer as canceled. Returns false if nothing was pending.
    pub(crate) fn cancel(&mut self) -> bool {
        if self.status != TransportStatus::Active {
            return false;
        }
        debug!(transport = self.kind, "transfer canceled");
        self.cancel.cancel();
        self.status = TransportStatus::Canceled;
        true
    }

    pub(crate) fn close(&mut self) {
        if self.status != TransportStatus::Closed {
            debug!(transport = self.kind, "transport closed");
        }
        self.status = TransportStatus::Closed;
        self.reply = None;
    }

    /// Runs `operation` until it completes, the deadline passes or the
    /// transfer is canceled.
    pub(crate) fn drive<T, F>(&self, operation: F) -> Outcome<T>
    where
        F: Future<Output = TransportResult<T>>,
    {
        drive(&self.runtime, &self.cancel, self.deadline, operation)
    }

    /// Runs `operation` to completion, ignoring deadline and cancellation.
    pub(crate) fn block_on<F: Future>(&self, operation: F) -> F::Output {
        self.runtime.block_on(operation)
    }

    /// Applies the outcome of a transfer and returns the new status.
    pub(crate) fn finish(&mut self, outcome: Outcome<Option<TransportMessage>>) -> TransportStatus {
        self.status = match outcome {
            Outcome::Completed(Some(reply)) => {
                debug!(
                    transport = self.kind,
                    bytes = reply.data.len(),
                    content_type = %reply.content_type,
                    "reply received"
                );
                self.reply = Some(reply);
                TransportStatus::GotReply
            }
            Outcome::Completed(None) => TransportStatus::Inactive,
            Outcome::Failed(err) => {
                warn!(transport = self.kind, error = %err, "transfer failed");
                self.last_error = Some(err);
                TransportStatus::Failed
            }
            Outcome::Canceled => {
                debug!(transport = self.kind, "transfer canceled");
                TransportStatus::Canceled
            }
            Outcome::TimedOut => {
                warn!(transport = self.kind, timeout = ?self.timeout, "transfer timed out");
                self.last_error = Some(TransportError::Timeout);
                TransportStatus::TimeOut
            }
        };
        self.status
    }
}

/// Runs `operation` on `runtime`, racing it against cancellation and the
/// deadline. Cancellation wins ties.
pub(crate) fn drive<T, F>(
    runtime: &Runtime,
    cancel: &CancelHandle,
    deadline: Option<Instant>,
    operation: F,
) -> Outcome<T>
where
    F: Future<Output = TransportResult<T>>,
{
    runtime.block_on(async {
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.canceled() => Outcome::Canceled,
            () = expired => Outcome::TimedOut,
            result = operation => match result {
                Ok(value) => Outcome::Completed(value),
                Err(TransportError::Canceled) => Outcome::Canceled,
                Err(TransportError::Timeout) => Outcome::TimedOut,
                Err(err) => Outcome::Failed(err),
            },
        }
    })
}
