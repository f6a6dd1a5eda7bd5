//! Wire protocol between a local sync parent and its child.
//!
//! Every message is one CBOR value in a frame prefixed by its length as
//! four big-endian bytes.

use crate::error::{TransportError, TransportResult};
use crate::ui::PasswordKey;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One source of a local sync as the child should run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRequest {
    /// Source name.
    pub name: String,
    /// Sync mode from the child's point of view.
    pub mode: String,
}

/// Everything the child needs to run its side of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSync {
    /// Configuration the child runs with, e.g. `target-config@phone`.
    pub config: String,
    /// Name of the parent's configuration.
    pub parent_config: String,
    /// Active sources.
    pub sources: Vec<SourceRequest>,
    /// User name for the child's data stores.
    pub username: String,
    /// Password for the child's data stores.
    pub password: String,
}

/// Messages from the parent to the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentMessage {
    /// Starts the session.
    StartSync(StartSync),
    /// A protocol message.
    Message {
        /// MIME type.
        content_type: String,
        /// Message bytes.
        data: Bytes,
    },
    /// Answer to [`ChildMessage::AskPassword`].
    PasswordResponse {
        /// Password, `None` if the user declined.
        password: Option<String>,
    },
    /// Answer to [`ChildMessage::SavePassword`].
    SavePasswordResponse {
        /// Whether the password was stored.
        saved: bool,
    },
}

/// Final status of the child's session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReport {
    /// Sync status code, 0 for success.
    pub status: u32,
    /// Error description for failed sessions.
    pub error: Option<String>,
}

impl ChildReport {
    /// Returns true if the child's session succeeded.
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Messages from the child to the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildMessage {
    /// The child is up and waits for [`ParentMessage::StartSync`].
    Ready,
    /// Reply to the last protocol message.
    Reply {
        /// MIME type.
        content_type: String,
        /// Message bytes.
        data: Bytes,
    },
    /// The child needs a password.
    AskPassword {
        /// Configuration name of the password.
        name: String,
        /// Text shown to the user.
        description: String,
        /// Keyring lookup key.
        key: PasswordKey,
    },
    /// The child wants a password stored.
    SavePassword {
        /// Configuration name of the password.
        name: String,
        /// The password.
        password: String,
        /// Keyring lookup key.
        key: PasswordKey,
    },
    /// The child's session ended.
    Report(ChildReport),
}

/// Writes one frame.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let mut payload = Vec::new();
    ciborium::into_writer(message, &mut payload)
        .map_err(|err| TransportError::Ipc(format!("encode: {err}")))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Ipc(format!("frame of {} bytes too large", payload.len())));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| TransportError::Ipc("frame too large".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `None` if the stream ended between frames.
///
/// # Errors
///
/// Returns an error if the stream ends inside a frame or the frame cannot be
/// decoded.
pub async fn read_frame<R, T>(reader: &mut R) -> TransportResult<Option<T>>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Ipc(format!("frame of {len} bytes too large")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    ciborium::from_reader(payload.as_slice())
        .map(Some)
        .map_err(|err| TransportError::Ipc(format!("decode: {err}")))
}
