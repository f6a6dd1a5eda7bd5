//! Starting the child side of a local sync.

use super::child::LocalChild;
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use std::ffi::OsString;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Reading end of the pipe from the child.
pub type ChildReader = Box<dyn AsyncRead + Unpin + Send>;
/// Writing end of the pipe to the child.
pub type ChildWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Controls a running child.
#[async_trait]
pub trait ChildHandle: Send {
    /// Waits for the child to end. Returns its exit code, `None` if it was
    /// killed.
    async fn wait(&mut self) -> TransportResult<Option<i32>>;

    /// Kills the child. Returns immediately, use `wait()` to reap it.
    fn kill(&mut self);
}

/// A started child with its pipes.
pub struct SpawnedChild {
    /// Frames from the child.
    pub reader: ChildReader,
    /// Frames to the child.
    pub writer: ChildWriter,
    /// Process control.
    pub handle: Box<dyn ChildHandle>,
}

impl std::fmt::Debug for SpawnedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedChild").finish_non_exhaustive()
    }
}

/// Starts children for local sync sessions.
#[async_trait]
pub trait ChildSpawner: Send + Sync {
    /// Starts one child.
    async fn spawn(&self) -> TransportResult<SpawnedChild>;
}

/// Runs the child as a separate program talking over stdin and stdout.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    /// Creates a spawner for `program`.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Adds a command line argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ChildSpawner for ProcessSpawner {
    async fn spawn(&self) -> TransportResult<SpawnedChild> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            TransportError::ChildFailed(format!("{}: {err}", self.program.to_string_lossy()))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::ChildFailed("child pipes unavailable".into()));
        };
        debug!(program = %self.program.to_string_lossy(), pid = ?child.id(), "local sync child started");

        Ok(SpawnedChild {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            handle: Box::new(ProcessHandle { child }),
        })
    }
}

struct ProcessHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildHandle for ProcessHandle {
    async fn wait(&mut self) -> TransportResult<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    fn kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(error = %err, "killing local sync child failed");
        }
    }
}

/// Capacity of the in-process pipes.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Runs the child as a function on its own thread.
///
/// The child gets a [`LocalChild`] wired to the parent. It exits with code 0
/// if the function returns `Ok`, 1 otherwise.
pub struct InProcessSpawner<F> {
    child: Arc<F>,
}

impl<F, Fut> InProcessSpawner<F>
where
    F: Fn(LocalChild) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransportResult<()>> + 'static,
{
    /// Creates a spawner running `child` for every session.
    pub fn new(child: F) -> Self {
        Self {
            child: Arc::new(child),
        }
    }
}

#[async_trait]
impl<F, Fut> ChildSpawner for InProcessSpawner<F>
where
    F: Fn(LocalChild) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransportResult<()>> + 'static,
{
    async fn spawn(&self) -> TransportResult<SpawnedChild> {
        let (parent_tx, child_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (child_tx, parent_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<Option<i32>>();

        let child = Arc::clone(&self.child);
        thread::Builder::new()
            .name("local-sync-child".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        warn!(error = %err, "local sync child runtime unavailable");
                        let _ = exit_tx.send(Some(1));
                        return;
                    }
                };
                let code = runtime.block_on(async move {
                    let run = (*child)(LocalChild::new(child_rx, child_tx));
                    tokio::select! {
                        result = run => match result {
                            Ok(()) => Some(0),
                            Err(err) => {
                                debug!(error = %err, "local sync child failed");
                                Some(1)
                            }
                        },
                        _ = kill_rx => None,
                    }
                });
                let _ = exit_tx.send(code);
            })
            .map_err(|err| TransportError::ChildFailed(err.to_string()))?;

        Ok(SpawnedChild {
            reader: Box::new(parent_rx),
            writer: Box::new(parent_tx),
            handle: Box::new(ThreadHandle {
                kill: Some(kill_tx),
                exit: Some(exit_rx),
                code: None,
            }),
        })
    }
}

struct ThreadHandle {
    kill: Option<oneshot::Sender<()>>,
    exit: Option<oneshot::Receiver<Option<i32>>>,
    code: Option<Option<i32>>,
}

#[async_trait]
impl ChildHandle for ThreadHandle {
    async fn wait(&mut self) -> TransportResult<Option<i32>> {
        if let Some(code) = self.code {
            return Ok(code);
        }
        let code = match self.exit.take() {
            // A dropped sender means the child panicked
            Some(exit) => exit.await.unwrap_or(None),
            None => None,
        };
        self.code = Some(code);
        Ok(code)
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}
