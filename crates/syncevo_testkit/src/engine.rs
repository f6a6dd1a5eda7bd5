//! A protocol engine playing a scripted peer.

use syncevo_engine::{
    ItemStatus, ItemStore, ProtocolEngine, SessionEnd, SessionInfo, SourceOffer, StepCommand,
    StepInput, SyncResult,
};
use syncevo_source::{ItemState, Luid};
use syncevo_transport::TransportMessage;

/// A change the peer sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    /// A new item.
    Add {
        /// Target source.
        source: String,
        /// Item content.
        data: Vec<u8>,
    },
    /// A changed item.
    Update {
        /// Target source.
        source: String,
        /// Local ID of the item.
        luid: Luid,
        /// Item content.
        data: Vec<u8>,
    },
    /// A removed item.
    Delete {
        /// Target source.
        source: String,
        /// Local ID of the item.
        luid: Luid,
    },
}

impl RemoteChange {
    /// Creates an add.
    pub fn add(source: &str, data: impl AsRef<[u8]>) -> Self {
        Self::Add {
            source: source.to_string(),
            data: data.as_ref().to_vec(),
        }
    }

    /// Creates an update.
    pub fn update(source: &str, luid: &str, data: impl AsRef<[u8]>) -> Self {
        Self::Update {
            source: source.to_string(),
            luid: Luid::new(luid),
            data: data.as_ref().to_vec(),
        }
    }

    /// Creates a delete.
    pub fn delete(source: &str, luid: &str) -> Self {
        Self::Delete {
            source: source.to_string(),
            luid: Luid::new(luid),
        }
    }
}

/// An item the engine sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentItem {
    /// Source of the item.
    pub source: String,
    /// Local ID.
    pub luid: Luid,
    /// Kind of change.
    pub state: ItemState,
    /// Content, empty for deletes.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    ChangesSent,
    MapSent,
}

/// Protocol engine with a fixed conversation.
///
/// 1. Start: every offered change is read and sent in one message
/// 2. Reply: the scripted remote changes are applied and a final message
///    is sent
/// 3. Reply: the session ends with the configured outcome
///
/// Suspend and abort end the session at once. The message body lists one
/// change per line as `<source> <state> <luid>`.
#[derive(Debug)]
pub struct ScriptedEngine {
    remote: Vec<RemoteChange>,
    outcome: SessionEnd,
    phase: Phase,
    session: Option<SessionInfo>,
    offers: Vec<SourceOffer>,
    sent: Vec<SentItem>,
    statuses: Vec<(String, Option<Luid>, ItemStatus)>,
    applied: usize,
    inputs: Vec<String>,
}

impl ScriptedEngine {
    /// Creates an engine whose peer has no changes.
    pub fn new() -> Self {
        Self {
            remote: Vec::new(),
            outcome: SessionEnd::Success,
            phase: Phase::Idle,
            session: None,
            offers: Vec::new(),
            sent: Vec::new(),
            statuses: Vec::new(),
            applied: 0,
            inputs: Vec::new(),
        }
    }

    /// Adds a change the peer sends.
    pub fn with_remote(mut self, change: RemoteChange) -> Self {
        self.remote.push(change);
        self
    }

    /// Sets how the session ends after the last reply.
    pub fn ending_with(mut self, outcome: SessionEnd) -> Self {
        self.outcome = outcome;
        self
    }

    /// Returns the session parameters passed to `begin()`.
    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    /// Returns the offers passed to `begin()`.
    pub fn offers(&self) -> &[SourceOffer] {
        &self.offers
    }

    /// Returns the items sent to the peer.
    pub fn sent(&self) -> &[SentItem] {
        &self.sent
    }

    /// Returns the failure statuses reported for items.
    pub fn statuses(&self) -> &[(String, Option<Luid>, ItemStatus)] {
        &self.statuses
    }

    /// Returns the number of remote changes applied successfully.
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Returns the kinds of input seen, in order.
    pub fn inputs(&self) -> Vec<&str> {
        self.inputs.iter().map(String::as_str).collect()
    }

    fn send_changes(&mut self, items: &mut dyn ItemStore) -> StepCommand {
        let mut body = String::new();
        for offer in &self.offers {
            if !offer.mode.sends_local_changes() {
                continue;
            }
            let changes = offer
                .changes
                .added
                .iter()
                .map(|luid| (luid, ItemState::Added))
                .chain(offer.changes.updated.iter().map(|luid| (luid, ItemState::Updated)))
                .chain(offer.changes.deleted.iter().map(|luid| (luid, ItemState::Deleted)));
            for (luid, state) in changes {
                let data = if state == ItemState::Deleted {
                    Vec::new()
                } else {
                    match items.read_item(&offer.name, luid) {
                        Ok(data) => data,
                        Err(status) => {
                            self.statuses
                                .push((offer.name.clone(), Some(luid.clone()), status));
                            continue;
                        }
                    }
                };
                body.push_str(&format!("{} {state:?} {luid}\n", offer.name));
                self.sent.push(SentItem {
                    source: offer.name.clone(),
                    luid: luid.clone(),
                    state,
                    data,
                });
            }
        }
        self.message(body)
    }

    fn apply_remote(&mut self, items: &mut dyn ItemStore) -> StepCommand {
        let mut body = String::new();
        for change in &self.remote {
            let (source, luid, result) = match change {
                RemoteChange::Add { source, data } => {
                    let result = items.insert_item(source, None, data);
                    let luid = result.as_ref().ok().map(|inserted| inserted.luid.clone());
                    (source, luid, result.map(|_| ()))
                }
                RemoteChange::Update { source, luid, data } => (
                    source,
                    Some(luid.clone()),
                    items.insert_item(source, Some(luid), data).map(|_| ()),
                ),
                RemoteChange::Delete { source, luid } => {
                    (source, Some(luid.clone()), items.delete_item(source, luid))
                }
            };
            let code = match result {
                Ok(()) => {
                    self.applied += 1;
                    200
                }
                Err(status) => {
                    self.statuses.push((source.clone(), luid.clone(), status));
                    status.code()
                }
            };
            let luid = luid.map(|luid| luid.to_string()).unwrap_or_default();
            body.push_str(&format!("{source} {code} {luid}\n"));
        }
        self.message(body)
    }

    fn message(&self, body: String) -> StepCommand {
        let content_type = self
            .session
            .as_ref()
            .map(|session| session.content_type.clone())
            .unwrap_or_default();
        StepCommand::Send {
            message: TransportMessage::new(body.into_bytes(), content_type),
            expect_reply: true,
        }
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolEngine for ScriptedEngine {
    fn begin(&mut self, session: &SessionInfo, offers: &[SourceOffer]) -> SyncResult<()> {
        self.session = Some(session.clone());
        self.offers = offers.to_vec();
        self.phase = Phase::Idle;
        Ok(())
    }

    fn step(&mut self, input: StepInput, items: &mut dyn ItemStore) -> SyncResult<StepCommand> {
        let kind = match &input {
            StepInput::Start => "start",
            StepInput::Reply(_) => "reply",
            StepInput::Sent => "sent",
            StepInput::Suspend => "suspend",
            StepInput::Abort => "abort",
        };
        self.inputs.push(kind.to_string());

        let command = match (input, self.phase) {
            (StepInput::Suspend, _) => StepCommand::Done(SessionEnd::Suspended),
            (StepInput::Abort, _) => StepCommand::Done(SessionEnd::Aborted),
            (StepInput::Start, _) => {
                self.phase = Phase::ChangesSent;
                self.send_changes(items)
            }
            (StepInput::Reply(_) | StepInput::Sent, Phase::ChangesSent) => {
                self.phase = Phase::MapSent;
                self.apply_remote(items)
            }
            (StepInput::Reply(_) | StepInput::Sent, _) => StepCommand::Done(self.outcome.clone()),
        };
        Ok(command)
    }
}
