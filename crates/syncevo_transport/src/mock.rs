//! Scripted transport for testing code that drives an agent.

use crate::agent::{CancelHandle, TransportAgent, TransportMessage, TransportStatus};
use crate::error::{TransportError, TransportResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the mock does with the next message.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Answers with the message.
    Reply(TransportMessage),
    /// Fails with a retryable connect error.
    Fail(String),
    /// Reports a timeout.
    TimeOut,
}

type SendHook = Box<dyn FnMut(&TransportMessage) + Send>;

/// Transport agent that answers from a script and records what was sent.
///
/// Every `wait()` consumes one scripted response; a `wait()` on an empty
/// script fails. A canceled [`CancelHandle`] wins over the script.
pub struct MockTransportAgent {
    script: VecDeque<MockResponse>,
    sent: Arc<Mutex<Vec<TransportMessage>>>,
    hook: Option<SendHook>,
    url: Option<String>,
    content_type: String,
    timeout: Option<Duration>,
    status: TransportStatus,
    reply: Option<TransportMessage>,
    last_error: Option<TransportError>,
    cancel: CancelHandle,
}

impl MockTransportAgent {
    /// Creates an agent answering with `script`.
    pub fn new(script: impl IntoIterator<Item = MockResponse>) -> Self {
        Self {
            script: script.into_iter().collect(),
            sent: Arc::new(Mutex::new(Vec::new())),
            hook: None,
            url: None,
            content_type: crate::agent::content_type::SYNCML_XML.to_string(),
            timeout: None,
            status: TransportStatus::Inactive,
            reply: None,
            last_error: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Calls `hook` for every sent message.
    pub fn with_send_hook(mut self, hook: impl FnMut(&TransportMessage) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Appends a response to the script.
    pub fn push(&mut self, response: MockResponse) {
        self.script.push_back(response);
    }

    /// Returns the log of sent messages. It stays valid after the agent is
    /// moved or dropped.
    pub fn sent(&self) -> Arc<Mutex<Vec<TransportMessage>>> {
        Arc::clone(&self.sent)
    }

    /// Returns the configured URL.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Returns the configured timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the number of unused responses.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl TransportAgent for MockTransportAgent {
    fn set_url(&mut self, url: &str) -> TransportResult<()> {
        self.url = Some(url.to_string());
        Ok(())
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|t| !t.is_zero());
    }

    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        match self.status {
            TransportStatus::Closed => return Err(TransportError::Closed),
            TransportStatus::Active => return Err(TransportError::Busy),
            _ => {}
        }
        let message = TransportMessage::new(data.to_vec(), self.content_type.clone());
        debug!(bytes = data.len(), "mock message sent");
        self.cancel.reset();
        self.reply = None;
        self.last_error = None;
        self.status = TransportStatus::Active;
        if let Some(hook) = &mut self.hook {
            hook(&message);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn cancel(&mut self) {
        if self.status == TransportStatus::Active {
            self.cancel.cancel();
            self.status = TransportStatus::Canceled;
        }
    }

    fn shutdown(&mut self) {
        self.reply = None;
        self.status = TransportStatus::Closed;
    }

    fn wait(&mut self, no_reply: bool) -> TransportStatus {
        if self.status != TransportStatus::Active {
            return self.status;
        }
        if self.cancel.is_canceled() {
            self.status = TransportStatus::Canceled;
            return self.status;
        }

        self.status = match self.script.pop_front() {
            Some(MockResponse::Reply(_)) if no_reply => TransportStatus::Inactive,
            Some(MockResponse::Reply(reply)) => {
                self.reply = Some(reply);
                TransportStatus::GotReply
            }
            Some(MockResponse::Fail(reason)) => {
                self.last_error = Some(TransportError::Connect(reason));
                TransportStatus::Failed
            }
            Some(MockResponse::TimeOut) => {
                self.last_error = Some(TransportError::Timeout);
                TransportStatus::TimeOut
            }
            None => {
                debug!("mock script exhausted");
                self.last_error = Some(TransportError::NoReply(TransportStatus::Active));
                TransportStatus::Failed
            }
        };
        self.status
    }

    fn get_reply(&self) -> TransportResult<&TransportMessage> {
        match (&self.status, &self.reply) {
            (TransportStatus::GotReply, Some(reply)) => Ok(reply),
            _ => Err(TransportError::NoReply(self.status)),
        }
    }

    fn status(&self) -> TransportStatus {
        self.status
    }

    fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for MockTransportAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransportAgent")
            .field("status", &self.status)
            .field("remaining", &self.script.len())
            .finish_non_exhaustive()
    }
}
