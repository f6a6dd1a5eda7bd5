//! Sync session driver.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    ItemStatus, ItemStore, ProtocolEngine, SessionEnd, SessionInfo, SourceOffer, StepCommand,
    StepInput,
};
use crate::registry::{SessionHandle, SessionRegistry, SessionRequest};
use crate::report::{ChangeCounts, ItemError, SourceReport, SyncReport, SyncStatus};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use syncevo_source::{InsertItemResult, Luid, Source, SourceError};
use syncevo_transport::{
    NoUserInterface, TransportAgent, TransportMessage, TransportStatus, UserInterface,
};
use tracing::{debug, error, info, warn};

/// The current state of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// No session is running.
    Idle,
    /// Sources are being opened and scanned.
    Preparing,
    /// Messages are being exchanged with the peer.
    Exchanging,
    /// Waiting before resending a message.
    RetryWait,
    /// Sources are being committed and closed.
    Finishing,
    /// The last session succeeded.
    Done,
    /// The last session failed.
    Error,
}

impl DriverState {
    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DriverState::Preparing
                | DriverState::Exchanging
                | DriverState::RetryWait
                | DriverState::Finishing
        )
    }

    /// Returns true if a new session may start.
    pub fn can_start(&self) -> bool {
        !self.is_active()
    }
}

/// Statistics over all sessions of a driver.
#[derive(Debug, Clone, Default)]
pub struct DriverStats {
    /// Sessions that ended successfully.
    pub sessions_completed: u64,
    /// Sessions that ended with an error, suspend or abort.
    pub sessions_failed: u64,
    /// Messages sent, resends included.
    pub messages_sent: u64,
    /// Number of resends.
    pub retries: u64,
    /// End of the last session.
    pub last_sync_time: Option<Instant>,
    /// Error of the last failed session.
    pub last_error: Option<String>,
}

/// Result of sending one message.
enum Exchange {
    Reply(TransportMessage),
    Sent,
    Interrupted(SessionRequest),
}

/// Drives sync sessions for one configuration.
///
/// A session opens the sources and detects their changes, hands them to the
/// protocol engine, relays the engine's messages through the transport
/// agent and finally commits the revision maps of the sources that
/// completed.
///
/// Sessions that could not start (busy, no password) are reported as
/// errors. Once started, the outcome is described by the returned
/// [`SyncReport`], failures included.
pub struct SyncEngineDriver {
    config: SyncConfig,
    registry: SessionRegistry,
    ui: Arc<dyn UserInterface>,
    state: RwLock<DriverState>,
    stats: RwLock<DriverStats>,
}

impl SyncEngineDriver {
    /// Creates a driver with its own session registry.
    pub fn new(config: SyncConfig) -> Self {
        Self::with_registry(config, SessionRegistry::new())
    }

    /// Creates a driver sharing `registry` with other drivers.
    pub fn with_registry(config: SyncConfig, registry: SessionRegistry) -> Self {
        Self {
            config,
            registry,
            ui: Arc::new(NoUserInterface),
            state: RwLock::new(DriverState::Idle),
            stats: RwLock::new(DriverStats::default()),
        }
    }

    /// Sets the interface used to ask for passwords.
    pub fn with_ui(mut self, ui: Arc<dyn UserInterface>) -> Self {
        self.ui = ui;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the registry the sessions are registered in.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Returns the handle of the running session, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        self.registry.get(&self.config.config_name)
    }

    /// Gets the current state.
    pub fn state(&self) -> DriverState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> DriverStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: DriverState) {
        *self.state.write() = state;
    }

    /// Runs one session over `sources`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SessionBusy`] if a session for this
    /// configuration is already running and
    /// [`SyncError::AuthenticationFailed`] if no password could be obtained.
    pub fn run(
        &self,
        sources: &mut [Source],
        engine: &mut dyn ProtocolEngine,
        agent: &mut dyn TransportAgent,
    ) -> SyncResult<SyncReport> {
        let name = self.config.config_name.clone();
        if !self.state().can_start() {
            return Err(SyncError::SessionBusy(name));
        }
        let handle = SessionHandle::new(agent.cancel_handle());
        let _guard = self.registry.register(&name, handle.clone())?;
        let start = Instant::now();
        self.set_state(DriverState::Preparing);
        info!(session = %name, url = %self.config.sync_url, "sync session starting");

        let password = match self.config.resolve_password(&*self.ui) {
            Ok(password) => password,
            Err(err) => {
                self.handle_error(&err);
                return Err(err);
            }
        };
        let info = SessionInfo {
            config_name: name.clone(),
            url: self.config.sync_url.clone(),
            username: self.config.username.clone(),
            password,
            content_type: self.config.content_type().to_string(),
        };
        agent.set_content_type(&info.content_type);
        agent.set_timeout(self.config.retry.message_timeout());

        let mut report = SyncReport::new(&name);
        let offers = self.prepare_sources(sources, &mut report);

        let end = match engine.begin(&info, &offers) {
            Ok(()) => {
                self.set_state(DriverState::Exchanging);
                self.exchange_messages(sources, engine, agent, &handle, &mut report)
            }
            Err(err) => Err(err),
        };

        self.set_state(DriverState::Finishing);
        match end {
            Ok(SessionEnd::Failed { status, message }) => {
                report.status = status;
                report.error = Some(message);
            }
            Ok(end) => report.status = end.status(),
            Err(err) => {
                error!(session = %name, error = %err, "sync session failed");
                report.status = err.status();
                report.error = Some(err.to_string());
            }
        }
        self.finish_sources(sources, &mut report);
        agent.shutdown();
        report.duration = start.elapsed();

        {
            let mut stats = self.stats.write();
            stats.messages_sent += report.messages_sent;
            stats.retries += report.retries;
            stats.last_sync_time = Some(Instant::now());
            if report.is_success() {
                stats.sessions_completed += 1;
                stats.last_error = None;
            } else {
                stats.sessions_failed += 1;
                stats.last_error = report.error.clone();
            }
        }
        self.set_state(if report.is_success() {
            DriverState::Done
        } else {
            DriverState::Error
        });
        info!(
            session = %name,
            status = %report.status,
            messages = report.messages_sent,
            retries = report.retries,
            item_errors = report.item_error_count(),
            "sync session finished"
        );
        Ok(report)
    }

    /// Opens every enabled source and collects its changes. Sources that
    /// cannot be opened are marked failed and left out.
    fn prepare_sources(&self, sources: &mut [Source], report: &mut SyncReport) -> Vec<SourceOffer> {
        let mut offers = Vec::new();
        for source in sources.iter_mut() {
            let mode = self.config.mode_for(source.name());
            let mut source_report = SourceReport::new(source.name(), mode);
            if mode.is_enabled() {
                match source.begin_sync(mode) {
                    Ok(changes) => {
                        source_report.local_changes = ChangeCounts {
                            added: changes.added.len() as u64,
                            updated: changes.updated.len() as u64,
                            deleted: changes.deleted.len() as u64,
                        };
                        offers.push(SourceOffer {
                            name: source.name().to_string(),
                            mode,
                            mime_type: source.mime_type().to_string(),
                            changes,
                        });
                    }
                    Err(err) => {
                        error!(source = source.name(), error = %err, "cannot start source");
                        source_report.fail(SyncStatus::DatastoreFailure, err.to_string());
                    }
                }
            } else {
                debug!(source = source.name(), "source disabled");
            }
            report.sources.insert(source.name().to_string(), source_report);
        }
        offers
    }

    /// Runs the engine until it ends the session.
    fn exchange_messages(
        &self,
        sources: &mut [Source],
        engine: &mut dyn ProtocolEngine,
        agent: &mut dyn TransportAgent,
        handle: &SessionHandle,
        report: &mut SyncReport,
    ) -> SyncResult<SessionEnd> {
        let mut delivered = SessionRequest::None;
        let mut input = StepInput::Start;
        loop {
            let request = handle.requested();
            if request != delivered {
                delivered = request;
                input = request_input(request, input);
            }

            let command = {
                let mut items = SessionItems {
                    sources: &mut *sources,
                    reports: &mut report.sources,
                };
                engine.step(input, &mut items)?
            };

            let (message, expect_reply) = match command {
                StepCommand::Done(end) => return Ok(end),
                StepCommand::Send { .. } if delivered == SessionRequest::Abort => {
                    debug!("engine wants to send after abort, ending session");
                    return Ok(SessionEnd::Aborted);
                }
                StepCommand::Send {
                    message,
                    expect_reply,
                } => (message, expect_reply),
            };

            input = match self.send_with_retry(agent, handle, delivered, &message, expect_reply, report)? {
                Exchange::Reply(reply) => StepInput::Reply(reply),
                Exchange::Sent => StepInput::Sent,
                Exchange::Interrupted(request) => {
                    delivered = request;
                    request_input(request, StepInput::Suspend)
                }
            };
        }
    }

    /// Sends one message, resending it after failures while the retry
    /// budget allows.
    fn send_with_retry(
        &self,
        agent: &mut dyn TransportAgent,
        handle: &SessionHandle,
        delivered: SessionRequest,
        message: &TransportMessage,
        expect_reply: bool,
        report: &mut SyncReport,
    ) -> SyncResult<Exchange> {
        let retry = &self.config.retry;
        let first_send = Instant::now();
        loop {
            let sent_at = Instant::now();
            agent.set_content_type(&message.content_type);
            agent.send(&message.data)?;
            report.messages_sent += 1;
            // a request that arrived during the engine step is not seen by
            // the cancel handle, which send() resets
            if handle.requested() != delivered {
                agent.cancel();
            }

            let status = agent.wait(!expect_reply);
            let (error, retryable) = match status {
                TransportStatus::GotReply => {
                    let reply = agent.get_reply()?.clone();
                    debug!(bytes = reply.data.len(), content_type = %reply.content_type, "got reply");
                    return Ok(Exchange::Reply(reply));
                }
                TransportStatus::Inactive if !expect_reply => return Ok(Exchange::Sent),
                TransportStatus::Canceled => {
                    let request = handle.requested();
                    if request != delivered {
                        return Ok(Exchange::Interrupted(request));
                    }
                    return Err(SyncError::transport_fatal("transfer canceled"));
                }
                TransportStatus::TimeOut => ("timed out waiting for reply".to_string(), true),
                TransportStatus::Failed => match agent.last_error() {
                    Some(err) => (err.to_string(), err.is_retryable()),
                    None => ("transport failed".to_string(), true),
                },
                other => {
                    return Err(SyncError::transport_fatal(format!(
                        "unexpected transport status {other:?}"
                    )))
                }
            };

            if !retryable {
                warn!(%error, "transport failed, not retrying");
                return Err(SyncError::transport_fatal(error));
            }
            let elapsed = first_send.elapsed();
            if !retry.allows_retry(elapsed) {
                warn!(%error, ?elapsed, "transport failed, retry budget exhausted");
                return Err(SyncError::transport_fatal(format!(
                    "{error}, gave up after {}s",
                    elapsed.as_secs()
                )));
            }

            let delay = retry.delay_before_resend(sent_at.elapsed());
            info!(%error, ?delay, attempt = report.retries + 1, "resending message");
            self.set_state(DriverState::RetryWait);
            let slept = handle.sleep(delay);
            self.set_state(DriverState::Exchanging);
            if !slept {
                return Ok(Exchange::Interrupted(handle.requested()));
            }
            report.retries += 1;
        }
    }

    /// Ends the session for every started source. Revision maps are only
    /// committed if the session and the source succeeded.
    fn finish_sources(&self, sources: &mut [Source], report: &mut SyncReport) {
        let session_ok = report.status.is_success();
        for source in sources.iter_mut() {
            let Some(source_report) = report.sources.get_mut(source.name()) else {
                continue;
            };
            if !source_report.mode.is_enabled() {
                continue;
            }
            if let Some(reason) = source.storage_failure() {
                source_report.fail(SyncStatus::DatastoreFailure, reason);
            }
            let commit = session_ok && source_report.status.is_success();
            match source.end_sync(commit) {
                Ok(committed) => source_report.committed = committed,
                Err(err) => {
                    error!(source = source.name(), error = %err, "cannot finish source");
                    source_report.fail(SyncStatus::DatastoreFailure, err.to_string());
                }
            }
        }

        if session_ok {
            if let Some(failed) = report.sources.values().find(|s| !s.status.is_success()) {
                report.status = failed.status;
                report.error = failed.error.clone();
            }
        }
    }

    fn handle_error(&self, error: &SyncError) {
        self.set_state(DriverState::Error);
        let mut stats = self.stats.write();
        stats.sessions_failed += 1;
        stats.last_error = Some(error.to_string());
    }
}

impl std::fmt::Debug for SyncEngineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngineDriver")
            .field("config", &self.config.config_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn request_input(request: SessionRequest, otherwise: StepInput) -> StepInput {
    match request {
        SessionRequest::Suspend => StepInput::Suspend,
        SessionRequest::Abort => StepInput::Abort,
        SessionRequest::None => otherwise,
    }
}

/// Item access for the engine during one step.
///
/// Source errors become item statuses here: item-level errors are recorded
/// and the session goes on, storage-level errors disable the source.
struct SessionItems<'a> {
    sources: &'a mut [Source],
    reports: &'a mut BTreeMap<String, SourceReport>,
}

impl SessionItems<'_> {
    fn lookup(&mut self, name: &str) -> Result<(&mut Source, &mut SourceReport), ItemStatus> {
        let report = self.reports.get_mut(name).ok_or(ItemStatus::NotFound)?;
        if !report.status.is_success() || !report.mode.is_enabled() {
            return Err(ItemStatus::DatastoreFailure);
        }
        let source = self
            .sources
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or(ItemStatus::NotFound)?;
        Ok((source, report))
    }
}

fn item_failed(
    source: &mut Source,
    report: &mut SourceReport,
    luid: Option<&Luid>,
    err: &SourceError,
) -> ItemStatus {
    let status = ItemStatus::from_error(err);
    if err.is_storage_failure() {
        error!(source = source.name(), error = %err, "data store failed");
        report.fail(SyncStatus::DatastoreFailure, err.to_string());
    } else if let Some(luid) = luid {
        source.record_failure(luid);
    } else {
        warn!(source = source.name(), error = %err, "new item failed");
    }
    report.item_errors.push(ItemError {
        luid: luid.cloned(),
        status,
        message: err.to_string(),
    });
    status
}

impl ItemStore for SessionItems<'_> {
    fn read_item(&mut self, source: &str, luid: &Luid) -> Result<Vec<u8>, ItemStatus> {
        let (source, report) = self.lookup(source)?;
        match source.read_item(luid) {
            Ok(data) => {
                report.items_sent += 1;
                Ok(data)
            }
            Err(err) => Err(item_failed(source, report, Some(luid), &err)),
        }
    }

    fn insert_item(
        &mut self,
        source: &str,
        luid: Option<&Luid>,
        data: &[u8],
    ) -> Result<InsertItemResult, ItemStatus> {
        let (source, report) = self.lookup(source)?;
        match source.insert_item(luid, data) {
            Ok(inserted) => {
                if luid.is_some() || inserted.was_update {
                    report.remote_changes.updated += 1;
                } else {
                    report.remote_changes.added += 1;
                }
                Ok(inserted)
            }
            Err(err) => Err(item_failed(source, report, luid, &err)),
        }
    }

    fn delete_item(&mut self, source: &str, luid: &Luid) -> Result<(), ItemStatus> {
        let (source, report) = self.lookup(source)?;
        match source.delete_item(luid) {
            Ok(()) => {
                report.remote_changes.deleted += 1;
                Ok(())
            }
            Err(SourceError::NotFound(_)) => {
                debug!(source = source.name(), %luid, "item to delete is already gone");
                report.item_errors.push(ItemError {
                    luid: Some(luid.clone()),
                    status: ItemStatus::NotFound,
                    message: format!("item {luid} not found"),
                });
                Err(ItemStatus::NotFound)
            }
            Err(err) => Err(item_failed(source, report, Some(luid), &err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use std::collections::BTreeMap as Map;
    use std::time::Duration;
    use syncevo_source::{RevisionMap, RevisionStore, SourceResult, SyncMode, SyncSource};
    use syncevo_storage::InMemoryNode;
    use syncevo_transport::{content_type, MockResponse, MockTransportAgent};

    /// Minimal backend: numbered items whose revision counts writes.
    #[derive(Default)]
    struct Items {
        name: &'static str,
        items: Map<String, (Vec<u8>, u32)>,
        next: u32,
        reject: Option<&'static str>,
    }

    impl Items {
        fn new(name: &'static str, items: &[(&str, &str)]) -> Self {
            let mut backend = Self {
                name,
                ..Self::default()
            };
            for (luid, data) in items {
                backend.items.insert(luid.to_string(), (data.as_bytes().to_vec(), 1));
            }
            backend.next = items.len() as u32 + 1;
            backend
        }
    }

    impl SyncSource for Items {
        fn name(&self) -> &str {
            self.name
        }

        fn mime_type(&self) -> &str {
            "text/plain"
        }

        fn open(&mut self) -> SourceResult<()> {
            Ok(())
        }

        fn close(&mut self) -> SourceResult<()> {
            Ok(())
        }

        fn list_all_items(&mut self) -> SourceResult<RevisionMap> {
            Ok(self
                .items
                .iter()
                .map(|(luid, (_, rev))| (luid.clone(), rev.to_string()))
                .collect())
        }

        fn read_item(&mut self, luid: &Luid) -> SourceResult<Vec<u8>> {
            self.items
                .get(luid.as_str())
                .map(|(data, _)| data.clone())
                .ok_or_else(|| SourceError::NotFound(luid.clone()))
        }

        fn insert_item(&mut self, luid: Option<&Luid>, data: &[u8]) -> SourceResult<InsertItemResult> {
            if let (Some(reject), Some(luid)) = (self.reject, luid) {
                if luid.as_str() == reject {
                    return Err(SourceError::item_failure(self.name, "rejected"));
                }
            }
            let key = match luid {
                Some(luid) => luid.as_str().to_string(),
                None => {
                    self.next += 1;
                    (self.next - 1).to_string()
                }
            };
            let entry = self.items.entry(key.clone()).or_insert((Vec::new(), 0));
            entry.0 = data.to_vec();
            entry.1 += 1;
            Ok(InsertItemResult::new(key, entry.1.to_string(), luid.is_some()))
        }

        fn remove_item(&mut self, luid: &Luid) -> SourceResult<()> {
            self.items
                .remove(luid.as_str())
                .map(|_| ())
                .ok_or_else(|| SourceError::NotFound(luid.clone()))
        }
    }

    /// Sends every offered item in one message, then applies the reply
    /// lines `source luid data` as updates.
    struct EchoEngine {
        offers: Vec<SourceOffer>,
        sent: bool,
    }

    impl EchoEngine {
        fn new() -> Self {
            Self {
                offers: Vec::new(),
                sent: false,
            }
        }
    }

    impl ProtocolEngine for EchoEngine {
        fn begin(&mut self, _session: &SessionInfo, offers: &[SourceOffer]) -> SyncResult<()> {
            self.offers = offers.to_vec();
            Ok(())
        }

        fn step(&mut self, input: StepInput, items: &mut dyn ItemStore) -> SyncResult<StepCommand> {
            match input {
                StepInput::Start => {
                    let mut body = Vec::new();
                    for offer in &self.offers {
                        for luid in offer.changes.added.iter().chain(&offer.changes.updated) {
                            if let Ok(data) = items.read_item(&offer.name, luid) {
                                body.extend_from_slice(&data);
                                body.push(b'\n');
                            }
                        }
                    }
                    self.sent = true;
                    Ok(StepCommand::Send {
                        message: TransportMessage::new(body, content_type::SYNCML_XML),
                        expect_reply: true,
                    })
                }
                StepInput::Reply(reply) => {
                    let text = String::from_utf8_lossy(&reply.data).into_owned();
                    for line in text.lines() {
                        let mut parts = line.splitn(3, ' ');
                        if let (Some(source), Some(luid), Some(data)) =
                            (parts.next(), parts.next(), parts.next())
                        {
                            let luid = Luid::new(luid);
                            let _ = items.insert_item(source, Some(&luid), data.as_bytes());
                        }
                    }
                    Ok(StepCommand::Done(SessionEnd::Success))
                }
                StepInput::Sent => Ok(StepCommand::Done(SessionEnd::Success)),
                StepInput::Suspend => Ok(StepCommand::Done(SessionEnd::Suspended)),
                StepInput::Abort => Ok(StepCommand::Done(SessionEnd::Aborted)),
            }
        }
    }

    fn reply(text: &str) -> MockResponse {
        MockResponse::Reply(TransportMessage::new(
            text.as_bytes().to_vec(),
            content_type::SYNCML_XML,
        ))
    }

    fn tracked(backend: Items, node: &InMemoryNode) -> Source {
        Source::with_tracking(backend, RevisionStore::new(node.clone()))
    }

    fn config() -> SyncConfig {
        SyncConfig::new("phone", "https://sync.example.com")
            .with_wbxml(false)
            .with_retry(RetryConfig::new(Duration::from_secs(5), Duration::from_millis(10)))
    }

    #[test]
    fn driver_state_checks() {
        assert!(DriverState::Idle.can_start());
        assert!(DriverState::Done.can_start());
        assert!(DriverState::Error.can_start());
        assert!(!DriverState::Exchanging.can_start());
        assert!(DriverState::RetryWait.is_active());
    }

    #[test]
    fn successful_session_commits() {
        let node = InMemoryNode::new("tracking");
        let mut sources = vec![tracked(Items::new("notes", &[("1", "a"), ("2", "b")]), &node)];
        let mut agent = MockTransportAgent::new([reply("notes 1 changed")]);
        let sent = agent.sent();
        let driver = SyncEngineDriver::new(config());

        let report = driver
            .run(&mut sources, &mut EchoEngine::new(), &mut agent)
            .unwrap();

        assert!(report.is_success());
        let notes = report.source("notes").unwrap();
        assert_eq!(notes.local_changes.added, 2);
        assert_eq!(notes.items_sent, 2);
        assert_eq!(notes.remote_changes.updated, 1);
        assert!(notes.committed);
        assert_eq!(&sent.lock()[0].data[..], b"a\nb\n");
        assert_eq!(node.snapshot().len(), 2);
        assert_eq!(node.snapshot().get("1").map(String::as_str), Some("2"));
        assert_eq!(driver.state(), DriverState::Done);
        assert_eq!(driver.stats().sessions_completed, 1);
        assert!(driver.registry().sessions().is_empty());
    }

    #[test]
    fn item_failure_does_not_fail_session() {
        let node = InMemoryNode::new("tracking");
        let mut backend = Items::new("notes", &[("1", "a"), ("2", "b")]);
        backend.reject = Some("2");
        let mut sources = vec![tracked(backend, &node)];
        let mut agent = MockTransportAgent::new([reply("notes 1 new-a\nnotes 2 new-b")]);
        let driver = SyncEngineDriver::new(config());

        let report = driver
            .run(&mut sources, &mut EchoEngine::new(), &mut agent)
            .unwrap();

        assert!(report.is_success());
        let notes = report.source("notes").unwrap();
        assert_eq!(notes.item_errors.len(), 1);
        assert_eq!(notes.item_errors[0].luid, Some(Luid::new("2")));
        assert_eq!(notes.item_errors[0].status, ItemStatus::CommandFailed);
        assert!(notes.committed);
        // "2" was new in this session and failed, so it is not committed
        let snapshot = node.snapshot();
        assert_eq!(snapshot.get("1").map(String::as_str), Some("2"));
        assert!(!snapshot.contains_key("2"));
    }

    #[test]
    fn timeout_is_retried() {
        let node = InMemoryNode::new("tracking");
        let mut sources = vec![tracked(Items::new("notes", &[("1", "a")]), &node)];
        let mut agent = MockTransportAgent::new([
            MockResponse::TimeOut,
            MockResponse::Fail("connection reset".into()),
            reply(""),
        ]);
        let sent = agent.sent();
        let driver = SyncEngineDriver::new(config());

        let report = driver
            .run(&mut sources, &mut EchoEngine::new(), &mut agent)
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.retries, 2);
        assert_eq!(report.messages_sent, 3);
        let sent = sent.lock();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|m| m.data == sent[0].data));
    }

    #[test]
    fn no_retry_budget_fails_session() {
        let node = InMemoryNode::new("tracking");
        let mut sources = vec![tracked(Items::new("notes", &[("1", "a")]), &node)];
        let mut agent = MockTransportAgent::new([MockResponse::TimeOut, reply("")]);
        let driver = SyncEngineDriver::new(config().with_retry(RetryConfig::no_retry()));

        let report = driver
            .run(&mut sources, &mut EchoEngine::new(), &mut agent)
            .unwrap();

        assert_eq!(report.status, SyncStatus::TransportFailure);
        assert!(!report.source("notes").unwrap().committed);
        assert!(node.snapshot().is_empty());
        assert_eq!(agent.remaining(), 1);
        assert_eq!(driver.state(), DriverState::Error);
        assert!(driver.stats().last_error.is_some());
    }

    #[test]
    fn suspend_keeps_revisions() {
        let node = InMemoryNode::new("tracking");
        let mut sources = vec![tracked(Items::new("notes", &[("1", "a")]), &node)];
        let driver = SyncEngineDriver::new(config());
        let registry = driver.registry().clone();
        let mut agent = MockTransportAgent::new([MockResponse::TimeOut]).with_send_hook(move |_| {
            if let Some(session) = registry.get("phone") {
                session.suspend();
            }
        });

        let report = driver
            .run(&mut sources, &mut EchoEngine::new(), &mut agent)
            .unwrap();

        assert_eq!(report.status, SyncStatus::Suspended);
        assert!(!report.source("notes").unwrap().committed);
        assert!(node.snapshot().is_empty());
    }

    #[test]
    fn busy_session_is_rejected() {
        let driver = SyncEngineDriver::new(config());
        let _running = driver
            .registry()
            .register("phone", SessionHandle::new(Default::default()))
            .unwrap();
        let mut agent = MockTransportAgent::new([]);

        let err = driver
            .run(&mut [], &mut EchoEngine::new(), &mut agent)
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionBusy(_)));
    }

    #[test]
    fn missing_password_fails_before_start() {
        let driver = SyncEngineDriver::new(config().with_credentials("joe", "-"));
        let mut agent = MockTransportAgent::new([]);

        let err = driver
            .run(&mut [], &mut EchoEngine::new(), &mut agent)
            .unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
        assert_eq!(driver.state(), DriverState::Error);
        assert!(agent.sent().lock().is_empty());
    }

    #[test]
    fn disabled_source_is_skipped() {
        let node = InMemoryNode::new("tracking");
        let mut sources = vec![tracked(Items::new("notes", &[("1", "a")]), &node)];
        let mut agent = MockTransportAgent::new([reply("")]);
        let sent = agent.sent();
        let driver =
            SyncEngineDriver::new(config().with_source("notes", SyncMode::Disabled));

        let report = driver
            .run(&mut sources, &mut EchoEngine::new(), &mut agent)
            .unwrap();

        assert!(report.is_success());
        assert!(!report.source("notes").unwrap().committed);
        assert!(sent.lock()[0].data.is_empty());
    }
}
