//! Local sync: the peer is a child running the other side of the session.
//!
//! The parent starts the child on the first `send()`, waits for it to be
//! ready and hands it the session parameters. Afterwards every message is
//! forwarded through a pipe. Password requests coming from the child are
//! answered through the parent's [`UserInterface`] while a reply is
//! awaited.

mod child;
mod ipc;
mod spawn;

pub use child::LocalChild;
pub use ipc::{
    read_frame, write_frame, ChildMessage, ChildReport, ParentMessage, SourceRequest, StartSync,
    MAX_FRAME_SIZE,
};
pub use spawn::{
    ChildHandle, ChildReader, ChildSpawner, ChildWriter, InProcessSpawner, ProcessSpawner,
    SpawnedChild,
};

use crate::agent::{AgentCore, CancelHandle, Outcome, TransportAgent, TransportMessage, TransportStatus};
use crate::error::{TransportError, TransportResult};
use crate::ui::{NoUserInterface, UserInterface};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a killed child may take to go away.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

struct ChildLink {
    reader: ChildReader,
    writer: Option<ChildWriter>,
    handle: Box<dyn ChildHandle>,
}

impl ChildLink {
    async fn start(spawner: &dyn ChildSpawner, start: &StartSync) -> TransportResult<Self> {
        let SpawnedChild {
            mut reader,
            mut writer,
            mut handle,
        } = spawner.spawn().await?;

        match read_frame::<_, ChildMessage>(&mut reader).await? {
            Some(ChildMessage::Ready) => {}
            Some(other) => {
                handle.kill();
                return Err(TransportError::Ipc(format!(
                    "expected Ready from child, got {}",
                    kind(&other)
                )));
            }
            None => {
                let code = handle.wait().await?;
                return Err(TransportError::ChildFailed(format!(
                    "child exited with {code:?} before it was ready"
                )));
            }
        }
        write_frame(&mut writer, &ParentMessage::StartSync(start.clone())).await?;
        debug!(config = %start.config, "local sync child ready");

        Ok(Self {
            reader,
            writer: Some(writer),
            handle,
        })
    }

    fn writer(&mut self) -> TransportResult<&mut ChildWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| TransportError::Ipc("pipe to child already closed".into()))
    }

    /// Forwards one message and collects the reply, answering password
    /// requests on the way.
    async fn exchange(
        &mut self,
        message: TransportMessage,
        no_reply: bool,
        ui: &dyn UserInterface,
        report: &mut Option<ChildReport>,
    ) -> TransportResult<Option<TransportMessage>> {
        let frame = ParentMessage::Message {
            content_type: message.content_type,
            data: message.data,
        };
        write_frame(self.writer()?, &frame).await?;
        if no_reply {
            return Ok(None);
        }

        loop {
            match read_frame::<_, ChildMessage>(&mut self.reader).await? {
                Some(ChildMessage::Reply { content_type, data }) => {
                    return Ok(Some(TransportMessage::new(data, content_type)));
                }
                Some(ChildMessage::AskPassword {
                    name,
                    description,
                    key,
                }) => {
                    debug!(%name, "child asks for password");
                    let password = ui.ask_password(&name, &description, &key);
                    write_frame(self.writer()?, &ParentMessage::PasswordResponse { password })
                        .await?;
                }
                Some(ChildMessage::SavePassword {
                    name,
                    password,
                    key,
                }) => {
                    let saved = ui.save_password(&name, &password, &key);
                    debug!(%name, saved, "child saves password");
                    write_frame(self.writer()?, &ParentMessage::SavePasswordResponse { saved })
                        .await?;
                }
                Some(ChildMessage::Report(child_report)) => {
                    debug!(status = child_report.status, "child sent report");
                    *report = Some(child_report);
                }
                Some(ChildMessage::Ready) => {
                    return Err(TransportError::Ipc("unexpected Ready from child".into()));
                }
                None => return Err(self.gone(report.as_ref()).await),
            }
        }
    }

    /// Explains why the child stopped talking.
    async fn gone(&mut self, report: Option<&ChildReport>) -> TransportError {
        if let Some(report) = report.filter(|report| !report.is_success()) {
            return TransportError::ChildReport {
                status: report.status,
                message: report.error.clone().unwrap_or_default(),
            };
        }
        match self.handle.wait().await {
            Ok(code) => {
                TransportError::ChildFailed(format!("child exited with {code:?} without replying"))
            }
            Err(err) => err,
        }
    }

    /// Closes the pipe to the child and waits until it is done, keeping its
    /// final report.
    async fn finish(&mut self, report: &mut Option<ChildReport>) -> TransportResult<Option<i32>> {
        self.writer = None;
        loop {
            match read_frame::<_, ChildMessage>(&mut self.reader).await {
                Ok(Some(ChildMessage::Report(child_report))) => *report = Some(child_report),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "ignoring broken child pipe during shutdown");
                    break;
                }
            }
        }
        self.handle.wait().await
    }
}

fn kind(message: &ChildMessage) -> &'static str {
    match message {
        ChildMessage::Ready => "Ready",
        ChildMessage::Reply { .. } => "Reply",
        ChildMessage::AskPassword { .. } => "AskPassword",
        ChildMessage::SavePassword { .. } => "SavePassword",
        ChildMessage::Report(_) => "Report",
    }
}

/// Transport agent talking to a local sync child.
///
/// The child is started on the first `send()`. It is killed when a transfer
/// is canceled or times out; afterwards every `send()` fails. `shutdown()`
/// closes the pipe and waits for the child to end on its own.
pub struct LocalTransportAgent {
    core: AgentCore,
    spawner: Box<dyn ChildSpawner>,
    start: StartSync,
    ui: Arc<dyn UserInterface>,
    link: Option<ChildLink>,
    started: bool,
    pending: Option<TransportMessage>,
    report: Option<ChildReport>,
    exit_code: Option<i32>,
}

impl LocalTransportAgent {
    /// Creates an agent that starts its child through `spawner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the I/O runtime cannot be created.
    pub fn new(spawner: impl ChildSpawner + 'static, start: StartSync) -> TransportResult<Self> {
        Ok(Self {
            core: AgentCore::new("local")?,
            spawner: Box::new(spawner),
            start,
            ui: Arc::new(NoUserInterface),
            link: None,
            started: false,
            pending: None,
            report: None,
            exit_code: None,
        })
    }

    /// Sets the interface answering the child's password requests.
    pub fn with_ui(mut self, ui: Arc<dyn UserInterface>) -> Self {
        self.ui = ui;
        self
    }

    /// Returns the last report sent by the child.
    pub fn child_report(&self) -> Option<&ChildReport> {
        self.report.as_ref()
    }

    /// Returns the child's exit code once it ended normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Returns true while a child is running.
    pub fn is_child_running(&self) -> bool {
        self.link.is_some()
    }

    fn kill_child(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        warn!("killing local sync child");
        link.handle.kill();
        let reaped = self
            .core
            .block_on(async { tokio::time::timeout(REAP_TIMEOUT, link.handle.wait()).await });
        if reaped.is_err() {
            warn!("local sync child did not exit after kill");
        }
    }
}

impl TransportAgent for LocalTransportAgent {
    /// Local sync needs no address; the URL is only kept for logging.
    fn set_url(&mut self, url: &str) -> TransportResult<()> {
        self.core.url = Some(url.to_string());
        Ok(())
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.core.content_type = content_type.to_string();
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.core.set_timeout(timeout);
    }

    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.core.status().can_send() && self.started && self.link.is_none() {
            return Err(TransportError::ChildFailed("local sync child is gone".into()));
        }
        self.core.begin_send(false, data.len())?;
        self.pending = Some(TransportMessage::new(
            Bytes::copy_from_slice(data),
            self.core.content_type.clone(),
        ));
        Ok(())
    }

    fn cancel(&mut self) {
        if self.core.cancel() {
            self.pending = None;
            self.kill_child();
        }
    }

    fn shutdown(&mut self) {
        self.pending = None;
        if let Some(mut link) = self.link.take() {
            let report = &mut self.report;
            match self.core.block_on(link.finish(report)) {
                Ok(code) => {
                    info!(exit_code = ?code, "local sync child finished");
                    self.exit_code = code;
                }
                Err(err) => warn!(error = %err, "waiting for local sync child failed"),
            }
        }
        self.core.close();
    }

    fn wait(&mut self, no_reply: bool) -> TransportStatus {
        if self.core.status() != TransportStatus::Active {
            return self.core.status();
        }
        let Some(message) = self.pending.take() else {
            return self.core.finish(Outcome::Canceled);
        };

        let Self {
            core,
            spawner,
            start,
            ui,
            link,
            started,
            report,
            ..
        } = self;
        let outcome = core.drive(async {
            if link.is_none() {
                *started = true;
                *link = Some(ChildLink::start(&**spawner, start).await?);
            }
            match link.as_mut() {
                Some(link) => link.exchange(message, no_reply, &**ui, report).await,
                None => Err(TransportError::ChildFailed("local sync child is gone".into())),
            }
        });

        if !matches!(outcome, Outcome::Completed(_)) {
            self.kill_child();
        }
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

impl std::fmt::Debug for LocalTransportAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransportAgent")
            .field("config", &self.start.config)
            .field("status", &self.core.status())
            .field("child_running", &self.link.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::PasswordKey;
    use parking_lot::Mutex;

    fn start() -> StartSync {
        StartSync {
            config: "target-config@client".into(),
            parent_config: "server".into(),
            sources: vec![SourceRequest {
                name: "calendar".into(),
                mode: "two-way".into(),
            }],
            ..StartSync::default()
        }
    }

    /// Child that upper-cases every message.
    async fn upper_child(mut child: LocalChild) -> TransportResult<()> {
        child.ready().await?;
        child.start().await?;
        while let Some(message) = child.next_message().await? {
            let upper = message.data.to_ascii_uppercase();
            child
                .reply(TransportMessage::new(upper, message.content_type))
                .await?;
        }
        child.report(ChildReport::default()).await
    }

    #[test]
    fn round_trips_and_clean_shutdown() {
        let mut agent = LocalTransportAgent::new(InProcessSpawner::new(upper_child), start()).unwrap();
        assert!(!agent.is_child_running());

        for text in ["hello", "world"] {
            agent.send(text.as_bytes()).unwrap();
            assert_eq!(agent.wait(false), TransportStatus::GotReply);
            let reply = agent.get_reply().unwrap();
            assert_eq!(&reply.data[..], text.to_ascii_uppercase().as_bytes());
        }
        assert!(agent.is_child_running());

        agent.shutdown();
        assert_eq!(agent.status(), TransportStatus::Closed);
        assert_eq!(agent.exit_code(), Some(0));
        assert!(agent.child_report().unwrap().is_success());
    }

    struct RecordingUi {
        saved: Mutex<Vec<(String, String)>>,
    }

    impl UserInterface for RecordingUi {
        fn ask_password(&self, name: &str, _description: &str, key: &PasswordKey) -> Option<String> {
            Some(format!("{name}-{}", key.user))
        }

        fn save_password(&self, name: &str, password: &str, _key: &PasswordKey) -> bool {
            self.saved.lock().push((name.to_string(), password.to_string()));
            true
        }
    }

    #[test]
    fn password_requests_reach_ui() {
        let spawner = InProcessSpawner::new(|mut child: LocalChild| async move {
            child.ready().await?;
            child.start().await?;
            while let Some(message) = child.next_message().await? {
                let key = PasswordKey::new("joe", "calendar");
                let password = child
                    .ask_password("databasePassword", "calendar", &key)
                    .await?
                    .unwrap_or_default();
                let saved = child.save_password("databasePassword", &password, &key).await?;
                let text = format!("{password}:{saved}");
                child
                    .reply(TransportMessage::new(text.into_bytes(), message.content_type))
                    .await?;
            }
            Ok(())
        });

        let ui = Arc::new(RecordingUi {
            saved: Mutex::new(Vec::new()),
        });
        let mut agent = LocalTransportAgent::new(spawner, start())
            .unwrap()
            .with_ui(ui.clone());
        agent.send(b"x").unwrap();
        assert_eq!(agent.wait(false), TransportStatus::GotReply);
        assert_eq!(&agent.get_reply().unwrap().data[..], b"databasePassword-joe:true");
        assert_eq!(
            ui.saved.lock().as_slice(),
            &[("databasePassword".to_string(), "databasePassword-joe".to_string())]
        );
        agent.shutdown();
    }

    #[test]
    fn failed_report_explains_dead_child() {
        let spawner = InProcessSpawner::new(|mut child: LocalChild| async move {
            child.ready().await?;
            child.start().await?;
            let _ = child.next_message().await?;
            child
                .report(ChildReport {
                    status: 10500,
                    error: Some("backend unavailable".into()),
                })
                .await?;
            Err(TransportError::ChildFailed("backend unavailable".into()))
        });

        let mut agent = LocalTransportAgent::new(spawner, start()).unwrap();
        agent.send(b"x").unwrap();
        assert_eq!(agent.wait(false), TransportStatus::Failed);
        assert!(matches!(
            agent.last_error(),
            Some(TransportError::ChildReport { status: 10500, .. })
        ));
        assert_eq!(agent.child_report().map(|r| r.status), Some(10500));

        // The child is gone for good
        assert!(matches!(agent.send(b"y"), Err(TransportError::ChildFailed(_))));
    }

    #[test]
    fn child_exiting_early_fails() {
        let spawner = InProcessSpawner::new(|_child: LocalChild| async { Ok(()) });
        let mut agent = LocalTransportAgent::new(spawner, start()).unwrap();
        agent.send(b"x").unwrap();
        assert_eq!(agent.wait(false), TransportStatus::Failed);
        assert!(matches!(agent.last_error(), Some(TransportError::ChildFailed(_))));
    }

    #[test]
    fn timeout_kills_child() {
        let spawner = InProcessSpawner::new(|mut child: LocalChild| async move {
            child.ready().await?;
            child.start().await?;
            let _ = child.next_message().await?;
            std::future::pending::<()>().await;
            Ok(())
        });

        let mut agent = LocalTransportAgent::new(spawner, start()).unwrap();
        agent.set_timeout(Some(Duration::from_millis(100)));
        agent.send(b"x").unwrap();
        assert_eq!(agent.wait(false), TransportStatus::TimeOut);
        assert!(!agent.is_child_running());
        assert!(matches!(agent.send(b"y"), Err(TransportError::ChildFailed(_))));

        agent.shutdown();
        assert_eq!(agent.status(), TransportStatus::Closed);
    }

    #[test]
    fn cancel_kills_child() {
        let mut agent = LocalTransportAgent::new(InProcessSpawner::new(upper_child), start()).unwrap();
        agent.send(b"a").unwrap();
        assert_eq!(agent.wait(false), TransportStatus::GotReply);

        agent.send(b"b").unwrap();
        agent.cancel();
        assert_eq!(agent.wait(false), TransportStatus::Canceled);
        assert!(!agent.is_child_running());
    }
}
