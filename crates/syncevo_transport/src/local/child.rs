//! The child's end of a local sync.

use super::ipc::{read_frame, write_frame, ChildMessage, ChildReport, ParentMessage, StartSync};
use super::spawn::{ChildReader, ChildWriter};
use crate::agent::TransportMessage;
use crate::error::{TransportError, TransportResult};
use crate::ui::PasswordKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Connection of a local sync child to its parent.
///
/// The child announces itself with [`ready`](Self::ready), receives the
/// session parameters with [`start`](Self::start) and then answers every
/// message from [`next_message`](Self::next_message) with
/// [`reply`](Self::reply). Before ending it sends its
/// [`report`](Self::report).
pub struct LocalChild {
    reader: ChildReader,
    writer: ChildWriter,
}

impl LocalChild {
    /// Wraps the pipes to the parent.
    pub fn new(
        reader: impl AsyncRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Talks to the parent over stdin and stdout.
    pub fn from_stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Tells the parent that the child is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is gone.
    pub async fn ready(&mut self) -> TransportResult<()> {
        write_frame(&mut self.writer, &ChildMessage::Ready).await
    }

    /// Receives the session parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is gone or sent something else.
    pub async fn start(&mut self) -> TransportResult<StartSync> {
        match self.read().await? {
            Some(ParentMessage::StartSync(start)) => {
                debug!(config = %start.config, sources = start.sources.len(), "local sync started");
                Ok(start)
            }
            Some(other) => Err(unexpected("StartSync", &other)),
            None => Err(TransportError::Ipc("parent closed before starting the sync".into())),
        }
    }

    /// Receives the next protocol message. Returns `None` once the parent is
    /// done.
    ///
    /// # Errors
    ///
    /// Returns an error on a broken pipe or an unexpected frame.
    pub async fn next_message(&mut self) -> TransportResult<Option<TransportMessage>> {
        match self.read().await? {
            Some(ParentMessage::Message { content_type, data }) => {
                Ok(Some(TransportMessage::new(data, content_type)))
            }
            Some(other) => Err(unexpected("Message", &other)),
            None => Ok(None),
        }
    }

    /// Answers the last message.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is gone.
    pub async fn reply(&mut self, message: TransportMessage) -> TransportResult<()> {
        write_frame(
            &mut self.writer,
            &ChildMessage::Reply {
                content_type: message.content_type,
                data: message.data,
            },
        )
        .await
    }

    /// Asks the parent's user interface for a password.
    ///
    /// Only valid between [`next_message`](Self::next_message) and
    /// [`reply`](Self::reply): the parent answers requests while it waits
    /// for a reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is gone or answered with something
    /// else.
    pub async fn ask_password(
        &mut self,
        name: &str,
        description: &str,
        key: &PasswordKey,
    ) -> TransportResult<Option<String>> {
        let request = ChildMessage::AskPassword {
            name: name.to_string(),
            description: description.to_string(),
            key: key.clone(),
        };
        write_frame(&mut self.writer, &request).await?;
        match self.read().await? {
            Some(ParentMessage::PasswordResponse { password }) => Ok(password),
            Some(other) => Err(unexpected("PasswordResponse", &other)),
            None => Err(TransportError::Ipc("parent closed during password request".into())),
        }
    }

    /// Asks the parent's user interface to store a password.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is gone or answered with something
    /// else.
    pub async fn save_password(
        &mut self,
        name: &str,
        password: &str,
        key: &PasswordKey,
    ) -> TransportResult<bool> {
        let request = ChildMessage::SavePassword {
            name: name.to_string(),
            password: password.to_string(),
            key: key.clone(),
        };
        write_frame(&mut self.writer, &request).await?;
        match self.read().await? {
            Some(ParentMessage::SavePasswordResponse { saved }) => Ok(saved),
            Some(other) => Err(unexpected("SavePasswordResponse", &other)),
            None => Err(TransportError::Ipc("parent closed during password request".into())),
        }
    }

    /// Sends the final session status.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is gone.
    pub async fn report(&mut self, report: ChildReport) -> TransportResult<()> {
        write_frame(&mut self.writer, &ChildMessage::Report(report)).await
    }

    async fn read(&mut self) -> TransportResult<Option<ParentMessage>> {
        read_frame(&mut self.reader).await
    }
}

impl std::fmt::Debug for LocalChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChild").finish_non_exhaustive()
    }
}

fn unexpected(expected: &str, got: &ParentMessage) -> TransportError {
    let got = match got {
        ParentMessage::StartSync(_) => "StartSync",
        ParentMessage::Message { .. } => "Message",
        ParentMessage::PasswordResponse { .. } => "PasswordResponse",
        ParentMessage::SavePasswordResponse { .. } => "SavePasswordResponse",
    };
    TransportError::Ipc(format!("expected {expected} from parent, got {got}"))
}
