//! Running sessions, looked up by configuration name.
//!
//! Signal handlers and other threads find the session they want to
//! interrupt here instead of through a global. The registry belongs to the
//! driver; clones share the same table.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncevo_transport::CancelHandle;
use tracing::{debug, info};

/// A second interrupt within this time aborts instead of suspending.
pub const ABORT_WINDOW: Duration = Duration::from_secs(2);

/// What the user asked a session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionRequest {
    /// Keep running.
    #[default]
    None,
    /// End the session so that it can be resumed.
    Suspend,
    /// End the session at once.
    Abort,
}

#[derive(Debug, Default)]
struct RequestState {
    request: SessionRequest,
    last_interrupt: Option<Instant>,
}

#[derive(Debug)]
struct HandleState {
    state: Mutex<RequestState>,
    changed: Condvar,
    cancel: CancelHandle,
}

/// Thread-safe control over a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<HandleState>,
}

impl SessionHandle {
    /// Creates a handle that interrupts transfers through `cancel`.
    pub fn new(cancel: CancelHandle) -> Self {
        Self {
            inner: Arc::new(HandleState {
                state: Mutex::new(RequestState::default()),
                changed: Condvar::new(),
                cancel,
            }),
        }
    }

    /// Asks the session to suspend. Ignored once an abort was requested.
    pub fn suspend(&self) {
        self.request(SessionRequest::Suspend);
    }

    /// Asks the session to abort.
    pub fn abort(&self) {
        self.request(SessionRequest::Abort);
    }

    /// Handles a user interrupt such as SIGINT: the first one suspends, a
    /// second one within [`ABORT_WINDOW`] aborts. Returns the resulting
    /// request.
    pub fn interrupt(&self) -> SessionRequest {
        let now = Instant::now();
        let escalate = {
            let mut state = self.inner.state.lock();
            let escalate = state
                .last_interrupt
                .is_some_and(|last| now.duration_since(last) < ABORT_WINDOW);
            state.last_interrupt = Some(now);
            escalate
        };
        if escalate {
            self.abort();
        } else {
            self.suspend();
        }
        self.requested()
    }

    /// Returns the pending request.
    pub fn requested(&self) -> SessionRequest {
        self.inner.state.lock().request
    }

    /// Sleeps for `duration` or until a request arrives. Returns true if the
    /// full time passed without a request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.inner.state.lock();
        while state.request == SessionRequest::None {
            if self
                .inner
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.request == SessionRequest::None;
            }
        }
        false
    }

    fn request(&self, request: SessionRequest) {
        {
            let mut state = self.inner.state.lock();
            if state.request == SessionRequest::Abort || state.request == request {
                return;
            }
            state.request = request;
        }
        info!(?request, "session interrupted");
        self.inner.changed.notify_all();
        self.inner.cancel.cancel();
    }
}

/// Table of running sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a running session. It stays registered until the returned
    /// guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SessionBusy`] if a session with that name is
    /// already running.
    pub fn register(&self, name: &str, handle: SessionHandle) -> SyncResult<SessionGuard> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(name) {
            return Err(SyncError::SessionBusy(name.to_string()));
        }
        sessions.insert(name.to_string(), handle);
        debug!(session = name, "session registered");
        Ok(SessionGuard {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    /// Returns the handle of a running session.
    pub fn get(&self, name: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(name).cloned()
    }

    /// Returns the names of all running sessions, sorted.
    pub fn sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Keeps a session registered.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    name: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions.lock().remove(&self.name);
        debug!(session = %self.name, "session unregistered");
    }
}
