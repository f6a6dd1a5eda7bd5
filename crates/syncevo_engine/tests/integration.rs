//! Integration tests for the session driver.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use syncevo_engine::{
    create_agent_with, ItemStatus, RetryConfig, SessionEnd, SessionRequest, SyncConfig,
    SyncEngineDriver, SyncStatus,
};
use syncevo_source::{ItemState, Luid, SyncMode};
use syncevo_testkit::prelude::*;
use syncevo_transport::local::{ChildReport, InProcessSpawner, LocalChild, StartSync};
use syncevo_transport::{
    LocalTransportAgent, MockResponse, MockTransportAgent, PasswordKey, TransportMessage,
    TransportResult, UserInterface,
};

/// Runs a first session so that the items of `backend` are known.
fn synced(backend: &MemoryBackend, node: &InMemoryNode, name: &str) {
    let driver = SyncEngineDriver::new(test_config("phone", &[name]));
    let mut sources = vec![memory_source(backend, node)];
    let report = driver
        .run(&mut sources, &mut ScriptedEngine::new(), &mut MockTransportAgent::new(replies(2)))
        .unwrap();
    assert!(report.is_success());
}

#[test]
fn two_way_session_exchanges_changes() {
    init_tracing();
    let backend = MemoryBackend::new("calendar")
        .with_item("1", "BEGIN:VEVENT\nSUMMARY:one")
        .with_item("2", "BEGIN:VEVENT\nSUMMARY:two");
    let node = InMemoryNode::new("calendar-tracking");
    let mut sources = vec![memory_source(&backend, &node)];
    let mut engine = ScriptedEngine::new()
        .with_remote(RemoteChange::add("calendar", "BEGIN:VEVENT\nSUMMARY:remote"))
        .with_remote(RemoteChange::update("calendar", "2", "BEGIN:VEVENT\nSUMMARY:two'"));
    let mut agent = MockTransportAgent::new(replies(2));
    let driver = SyncEngineDriver::new(test_config("phone", &["calendar"]));

    let report = driver.run(&mut sources, &mut engine, &mut agent).unwrap();

    assert!(report.is_success());
    assert_eq!(report.messages_sent, 2);
    let calendar = report.source("calendar").unwrap();
    assert_eq!(calendar.local_changes.added, 2);
    assert_eq!(calendar.items_sent, 2);
    assert_eq!(calendar.remote_changes.added, 1);
    assert_eq!(calendar.remote_changes.updated, 1);
    assert!(calendar.committed);

    assert_eq!(engine.sent().len(), 2);
    assert_eq!(engine.applied(), 2);
    assert_eq!(backend.len(), 3);
    assert_eq!(node.snapshot().len(), 3);
    assert!(!backend.is_open());

    let session = engine.session().unwrap();
    assert_eq!(session.config_name, "phone");
    assert_eq!(session.content_type, "application/vnd.syncml+xml");
}

#[test]
fn second_session_only_sends_changes() {
    let backend = MemoryBackend::new("todo")
        .with_item("1", "a")
        .with_item("2", "b")
        .with_item("3", "c");
    let node = InMemoryNode::new("todo-tracking");
    synced(&backend, &node, "todo");

    backend.set_item("2", "b2");
    backend.remove("3");
    backend.set_item("4", "d");

    let mut engine = ScriptedEngine::new();
    let driver = SyncEngineDriver::new(test_config("phone", &["todo"]));
    let report = driver
        .run(
            &mut [memory_source(&backend, &node)],
            &mut engine,
            &mut MockTransportAgent::new(replies(2)),
        )
        .unwrap();

    assert!(report.is_success());
    let sent: Vec<(&str, ItemState)> = engine
        .sent()
        .iter()
        .map(|item| (item.luid.as_str(), item.state))
        .collect();
    assert_eq!(
        sent,
        vec![
            ("4", ItemState::Added),
            ("2", ItemState::Updated),
            ("3", ItemState::Deleted),
        ]
    );
    assert!(engine.sent()[2].data.is_empty());
}

#[test]
fn failed_item_is_recorded_and_others_commit() {
    let backend = MemoryBackend::new("addressbook")
        .with_item("x", "BEGIN:VCARD\nFN:X")
        .with_item("y", "BEGIN:VCARD\nFN:Y")
        .with_item("z", "BEGIN:VCARD\nFN:Z");
    let node = InMemoryNode::new("addressbook-tracking");
    synced(&backend, &node, "addressbook");
    let before = node.snapshot();

    backend.fail_insert("x");
    let mut engine = ScriptedEngine::new()
        .with_remote(RemoteChange::update("addressbook", "x", "BEGIN:VCARD\nFN:X2"))
        .with_remote(RemoteChange::update("addressbook", "y", "BEGIN:VCARD\nFN:Y2"))
        .with_remote(RemoteChange::delete("addressbook", "z"));
    let driver = SyncEngineDriver::new(test_config("phone", &["addressbook"]));
    let report = driver
        .run(
            &mut [memory_source(&backend, &node)],
            &mut engine,
            &mut MockTransportAgent::new(replies(2)),
        )
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.item_error_count(), 1);
    let addressbook = report.source("addressbook").unwrap();
    assert_eq!(addressbook.item_errors[0].luid, Some(Luid::new("x")));
    assert_eq!(addressbook.item_errors[0].status, ItemStatus::CommandFailed);
    assert_eq!(addressbook.remote_changes.updated, 1);
    assert_eq!(addressbook.remote_changes.deleted, 1);
    assert!(addressbook.committed);
    assert_eq!(
        engine.statuses(),
        &[("addressbook".to_string(), Some(Luid::new("x")), ItemStatus::CommandFailed)]
    );

    let after = node.snapshot();
    assert_eq!(after.get("x"), before.get("x"));
    assert_ne!(after.get("y"), before.get("y"));
    assert!(!after.contains_key("z"));
    assert_eq!(backend.item("x").as_deref(), Some(&b"BEGIN:VCARD\nFN:X"[..]));
}

#[test]
fn unreadable_item_is_sent_again_next_time() {
    let backend = MemoryBackend::new("memo").with_item("1", "a").with_item("2", "b");
    let node = InMemoryNode::new("memo-tracking");
    synced(&backend, &node, "memo");

    backend.set_item("1", "a2");
    backend.set_item("2", "b2");
    backend.fail_read("2");
    let mut engine = ScriptedEngine::new();
    let driver = SyncEngineDriver::new(test_config("phone", &["memo"]));
    let report = driver
        .run(
            &mut [memory_source(&backend, &node)],
            &mut engine,
            &mut MockTransportAgent::new(replies(2)),
        )
        .unwrap();
    assert!(report.is_success());
    assert_eq!(engine.sent().len(), 1);
    assert_eq!(report.item_error_count(), 1);

    backend.heal();
    let mut engine = ScriptedEngine::new();
    driver
        .run(
            &mut [memory_source(&backend, &node)],
            &mut engine,
            &mut MockTransportAgent::new(replies(2)),
        )
        .unwrap();
    let sent: Vec<&str> = engine.sent().iter().map(|item| item.luid.as_str()).collect();
    assert_eq!(sent, vec!["2"]);
}

#[test]
fn storage_failure_only_affects_its_source() {
    let calendar = MemoryBackend::new("calendar").with_item("1", "event");
    let todo = MemoryBackend::new("todo").with_item("1", "task");
    let calendar_node = InMemoryNode::new("calendar-tracking");
    let todo_node = InMemoryNode::new("todo-tracking");

    let failing = calendar.clone();
    let mut agent = MockTransportAgent::new(replies(2)).with_send_hook(move |_| {
        failing.fail_storage("database locked");
    });
    let mut engine = ScriptedEngine::new()
        .with_remote(RemoteChange::add("calendar", "remote event"))
        .with_remote(RemoteChange::add("todo", "remote task"));
    let driver = SyncEngineDriver::new(test_config("phone", &["calendar", "todo"]));

    let report = driver
        .run(
            &mut [
                memory_source(&calendar, &calendar_node),
                memory_source(&todo, &todo_node),
            ],
            &mut engine,
            &mut agent,
        )
        .unwrap();

    assert_eq!(report.status, SyncStatus::DatastoreFailure);
    let calendar_report = report.source("calendar").unwrap();
    assert_eq!(calendar_report.status, SyncStatus::DatastoreFailure);
    assert!(!calendar_report.committed);
    assert_eq!(calendar_report.item_errors[0].status, ItemStatus::DatastoreFailure);
    assert!(calendar_node.snapshot().is_empty());

    let todo_report = report.source("todo").unwrap();
    assert!(todo_report.status.is_success());
    assert!(todo_report.committed);
    assert_eq!(todo_node.snapshot().len(), 2);
}

#[test]
fn source_that_cannot_open_is_left_out() {
    let broken = MemoryBackend::new("calendar").with_item("1", "event");
    broken.fail_open("no such database");
    let todo = MemoryBackend::new("todo").with_item("1", "task");
    let mut engine = ScriptedEngine::new();
    let driver = SyncEngineDriver::new(test_config("phone", &["calendar", "todo"]));

    let report = driver
        .run(
            &mut [
                memory_source(&broken, &InMemoryNode::new("calendar-tracking")),
                memory_source(&todo, &InMemoryNode::new("todo-tracking")),
            ],
            &mut engine,
            &mut MockTransportAgent::new(replies(2)),
        )
        .unwrap();

    assert_eq!(engine.offers().len(), 1);
    assert_eq!(engine.offers()[0].name, "todo");
    assert_eq!(
        report.source("calendar").unwrap().status,
        SyncStatus::DatastoreFailure
    );
    assert!(report.source("todo").unwrap().committed);
    assert!(!report.is_success());
}

#[test]
fn transient_failures_are_retried() {
    let backend = MemoryBackend::new("calendar").with_item("1", "event");
    let node = InMemoryNode::new("calendar-tracking");
    let mut agent = MockTransportAgent::new([
        MockResponse::TimeOut,
        MockResponse::Fail("connection reset".into()),
        reply(""),
        MockResponse::TimeOut,
        reply(""),
    ]);
    let sent = agent.sent();
    let driver = SyncEngineDriver::new(test_config("phone", &["calendar"]));

    let report = driver
        .run(&mut [memory_source(&backend, &node)], &mut ScriptedEngine::new(), &mut agent)
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.retries, 3);
    assert_eq!(report.messages_sent, 5);
    let sent = sent.lock();
    assert_eq!(sent[0], sent[1]);
    assert_eq!(sent[1], sent[2]);
    assert_eq!(sent[3], sent[4]);
    assert_eq!(driver.stats().retries, 3);
}

#[test]
fn retry_budget_is_limited() {
    let backend = MemoryBackend::new("calendar").with_item("1", "event");
    let node = InMemoryNode::new("calendar-tracking");
    let mut agent = MockTransportAgent::new(std::iter::repeat(MockResponse::TimeOut).take(1000));
    let config = test_config("phone", &["calendar"])
        .with_retry(RetryConfig::new(Duration::from_millis(200), Duration::from_millis(20)));
    let driver = SyncEngineDriver::new(config);

    let report = driver
        .run(&mut [memory_source(&backend, &node)], &mut ScriptedEngine::new(), &mut agent)
        .unwrap();

    assert_eq!(report.status, SyncStatus::TransportFailure);
    assert!(report.retries >= 1);
    assert!(report.retries < 50);
    assert!(!report.source("calendar").unwrap().committed);
    assert!(node.snapshot().is_empty());
}

#[test]
fn engine_failure_commits_nothing() {
    let backend = MemoryBackend::new("calendar").with_item("1", "event");
    let node = InMemoryNode::new("calendar-tracking");
    let driver = SyncEngineDriver::new(test_config("phone", &["calendar"]));
    let mut engine = ScriptedEngine::new().ending_with(SessionEnd::Failed {
        status: SyncStatus::Unauthorized,
        message: "credentials rejected".into(),
    });

    let report = driver
        .run(
            &mut [memory_source(&backend, &node)],
            &mut engine,
            &mut MockTransportAgent::new(replies(2)),
        )
        .unwrap();

    assert_eq!(report.status, SyncStatus::Unauthorized);
    assert_eq!(report.error.as_deref(), Some("credentials rejected"));
    assert_eq!(report.retries, 0);
    assert!(!report.source("calendar").unwrap().committed);
    assert!(node.snapshot().is_empty());
    assert_eq!(driver.stats().sessions_failed, 1);
}

#[test]
fn suspended_session_can_resume() {
    let backend = MemoryBackend::new("calendar")
        .with_item("1", "a")
        .with_item("2", "b");
    let node = InMemoryNode::new("calendar-tracking");
    let driver = SyncEngineDriver::new(test_config("phone", &["calendar"]));
    let registry = driver.registry().clone();
    let mut agent = MockTransportAgent::new(replies(2)).with_send_hook(move |_| {
        if let Some(session) = registry.get("phone") {
            session.suspend();
        }
    });
    let mut engine = ScriptedEngine::new();

    let report = driver
        .run(&mut [memory_source(&backend, &node)], &mut engine, &mut agent)
        .unwrap();

    assert_eq!(report.status, SyncStatus::Suspended);
    assert_eq!(engine.inputs(), vec!["start", "suspend"]);
    assert!(node.snapshot().is_empty());
    assert!(driver.registry().sessions().is_empty());

    let mut engine = ScriptedEngine::new();
    let report = driver
        .run(
            &mut [memory_source(&backend, &node)],
            &mut engine,
            &mut MockTransportAgent::new(replies(2)),
        )
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.source("calendar").unwrap().local_changes.added, 2);
    assert_eq!(node.snapshot().len(), 2);
}

#[test]
fn double_interrupt_aborts() {
    let backend = MemoryBackend::new("calendar").with_item("1", "a");
    let node = InMemoryNode::new("calendar-tracking");
    let driver = SyncEngineDriver::new(test_config("phone", &["calendar"]));
    let registry = driver.registry().clone();
    let mut agent = MockTransportAgent::new(replies(2)).with_send_hook(move |_| {
        if let Some(session) = registry.get("phone") {
            assert_eq!(session.interrupt(), SessionRequest::Suspend);
            assert_eq!(session.interrupt(), SessionRequest::Abort);
        }
    });
    let mut engine = ScriptedEngine::new();

    let report = driver
        .run(&mut [memory_source(&backend, &node)], &mut engine, &mut agent)
        .unwrap();

    assert_eq!(report.status, SyncStatus::Aborted);
    assert_eq!(engine.inputs(), vec!["start", "abort"]);
    assert!(node.snapshot().is_empty());
}

#[test]
fn one_way_from_remote_sends_nothing() {
    let backend = MemoryBackend::new("calendar").with_item("1", "a");
    let node = InMemoryNode::new("calendar-tracking");
    let config = test_config("phone", &[]).with_source("calendar", SyncMode::OneWayFromRemote);
    let mut engine = ScriptedEngine::new().with_remote(RemoteChange::add("calendar", "remote"));

    let report = SyncEngineDriver::new(config)
        .run(
            &mut [memory_source(&backend, &node)],
            &mut engine,
            &mut MockTransportAgent::new(replies(2)),
        )
        .unwrap();

    assert!(report.is_success());
    assert!(engine.sent().is_empty());
    assert_eq!(backend.len(), 2);
}

#[test]
fn file_source_session() {
    let fixture = FileSourceFixture::new("notes");
    fixture.write_item("1", "first note");
    fixture.write_item("2", "second note");
    let driver = SyncEngineDriver::new(test_config("phone", &["notes"]));

    let mut engine = ScriptedEngine::new().with_remote(RemoteChange::add("notes", "from peer"));
    let report = driver
        .run(&mut [fixture.source()], &mut engine, &mut MockTransportAgent::new(replies(2)))
        .unwrap();
    assert!(report.is_success());
    assert_eq!(engine.sent().len(), 2);
    assert!(report.source("notes").unwrap().committed);

    fixture.remove_item("1");
    let mut engine = ScriptedEngine::new();
    driver
        .run(&mut [fixture.source()], &mut engine, &mut MockTransportAgent::new(replies(2)))
        .unwrap();
    let sent: Vec<(&str, ItemState)> = engine
        .sent()
        .iter()
        .map(|item| (item.luid.as_str(), item.state))
        .collect();
    assert_eq!(sent, vec![("1", ItemState::Deleted)]);
}

struct Keyring;

impl UserInterface for Keyring {
    fn ask_password(&self, _name: &str, _description: &str, key: &PasswordKey) -> Option<String> {
        (key.user == "joe").then(|| "from-keyring".to_string())
    }

    fn save_password(&self, _name: &str, _password: &str, _key: &PasswordKey) -> bool {
        false
    }
}

/// Start request and password seen by a local sync child.
type PeerLog = Arc<Mutex<Option<(StartSync, String)>>>;

/// Peer side of a local sync answering every message with its credentials.
/// A password it was not given is asked from the parent while handling the
/// first message.
async fn serve_peer(mut child: LocalChild, log: Option<PeerLog>) -> TransportResult<()> {
    child.ready().await?;
    let start: StartSync = child.start().await?;
    let mut password = start.password.clone();
    while let Some(message) = child.next_message().await? {
        if password.is_empty() {
            let key = PasswordKey::new(start.username.clone(), start.parent_config.clone());
            password = child
                .ask_password(&start.config, "peer password", &key)
                .await?
                .unwrap_or_default();
        }
        if let Some(log) = &log {
            *log.lock() = Some((start.clone(), password.clone()));
        }
        let body = format!("{}:{password}", start.username);
        child
            .reply(TransportMessage::new(body.into_bytes(), message.content_type))
            .await?;
    }
    child.report(ChildReport::default()).await
}

async fn echo_peer(child: LocalChild) -> TransportResult<()> {
    serve_peer(child, None).await
}

#[test]
fn local_sync_with_password_from_ui() {
    let backend = MemoryBackend::new("calendar").with_item("1", "a");
    let node = InMemoryNode::new("calendar-tracking");
    let config = SyncConfig::new("desktop", "local://@phone")
        .with_credentials("joe", "-")
        .with_source("calendar", SyncMode::TwoWay)
        .with_retry(RetryConfig::new(Duration::from_secs(10), Duration::from_secs(5)));
    let start = syncevo_engine::local_sync_request(&config, "phone");
    assert_eq!(start.sources[0].mode, "two-way");

    let mut agent = LocalTransportAgent::new(InProcessSpawner::new(echo_peer), start)
        .unwrap()
        .with_ui(Arc::new(Keyring));
    let driver = SyncEngineDriver::new(config).with_ui(Arc::new(Keyring));
    let mut engine = ScriptedEngine::new();

    let report = driver
        .run(&mut [memory_source(&backend, &node)], &mut engine, &mut agent)
        .unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(engine.session().unwrap().password, "from-keyring");
    assert_eq!(agent.exit_code(), Some(0));
    assert_eq!(node.snapshot().len(), 1);
}

#[test]
fn local_sync_through_agent_factory() {
    let backend = MemoryBackend::new("calendar").with_item("1", "a");
    let node = InMemoryNode::new("calendar-tracking");
    let config = SyncConfig::new("desktop", "local://@phone")
        .with_credentials("joe", "-")
        .with_source("calendar", SyncMode::TwoWay)
        .with_source("todo", SyncMode::Disabled)
        .with_retry(RetryConfig::new(Duration::from_secs(10), Duration::from_secs(5)));

    let log = PeerLog::default();
    let peer_log = Arc::clone(&log);
    let mut agent = create_agent_with(&config, Arc::new(Keyring), move |start| {
        assert_eq!(start.config, "target-config@phone");
        InProcessSpawner::new(move |child| serve_peer(child, Some(Arc::clone(&peer_log))))
    })
    .unwrap();
    let driver = SyncEngineDriver::new(config).with_ui(Arc::new(Keyring));
    let mut engine = ScriptedEngine::new();

    let report = driver
        .run(&mut [memory_source(&backend, &node)], &mut engine, agent.as_mut())
        .unwrap();

    assert!(report.is_success(), "{report:?}");
    let (start, password) = log.lock().clone().expect("child did not start");
    assert_eq!(start.parent_config, "desktop");
    assert_eq!(start.username, "joe");
    assert!(start.password.is_empty());
    assert_eq!(password, "from-keyring");
    let sources: Vec<(&str, &str)> = start
        .sources
        .iter()
        .map(|source| (source.name.as_str(), source.mode.as_str()))
        .collect();
    assert_eq!(sources, vec![("calendar", "two-way")]);
    assert_eq!(node.snapshot().len(), 1);
}
