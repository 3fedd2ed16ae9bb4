use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::debug;

use super::channel::{Command, Reply, WorkerMessage, WorkerResult};
use super::dispatcher::{WorkerContext, WorkerExit, run_worker};
use super::wire::{FrameBuffer, Transport};
use crate::error::SqlAccessError;
use crate::sqlite::SqliteOptions;

/// Sent by a worker thread when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitNotice {
    pub(crate) index: usize,
    pub(crate) generation: u64,
    pub(crate) crashed: bool,
}

pub(crate) enum SupervisorEvent {
    Exited(ExitNotice),
    Stop,
}

/// Reports the worker's exit even when the thread unwinds.
struct ExitGuard {
    notice: ExitNotice,
    exits: Option<Sender<SupervisorEvent>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        debug!(
            index = self.notice.index,
            generation = self.notice.generation,
            crashed = self.notice.crashed,
            "sqlite worker exited"
        );
        if let Some(exits) = &self.exits {
            let _ = exits.send(SupervisorEvent::Exited(self.notice));
        }
    }
}

/// Sending side of one worker thread. Clones address the same worker.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    index: usize,
    generation: u64,
    sender: Sender<Command>,
    frame: Option<Arc<Mutex<FrameBuffer>>>,
}

impl WorkerHandle {
    /// Move `conn` onto a new worker thread.
    pub(crate) fn spawn(
        index: usize,
        generation: u64,
        conn: Connection,
        options: &SqliteOptions,
        exits: Option<Sender<SupervisorEvent>>,
    ) -> Result<(Self, JoinHandle<()>), SqlAccessError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let frame = match options.transport {
            Transport::Direct => None,
            Transport::SharedBuffer { capacity } => {
                Some(Arc::new(Mutex::new(FrameBuffer::new(capacity))))
            }
        };
        let ctx = WorkerContext {
            retry: options.busy_retry.clone(),
            expose_sql: options.expose_sql_in_errors,
            analysis_limit: options.analysis_limit,
            frame: frame.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("sqlite-worker-{index}"))
            .spawn(move || {
                let mut guard = ExitGuard {
                    notice: ExitNotice {
                        index,
                        generation,
                        crashed: true,
                    },
                    exits,
                };
                debug!(index, generation, "sqlite worker started");
                guard.notice.crashed = run_worker(conn, &receiver, &ctx) == WorkerExit::Crashed;
            })
            .map_err(|err| {
                SqlAccessError::ConnectionError(format!(
                    "failed to spawn SQLite worker thread: {err}"
                ))
            })?;

        Ok((
            Self {
                index,
                generation,
                sender,
                frame,
            },
            thread,
        ))
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&self, command: Command) -> Result<(), SqlAccessError> {
        self.sender
            .send(command)
            .map_err(|_| self.crashed("before accepting the request"))
    }

    fn crashed(&self, during: &str) -> SqlAccessError {
        SqlAccessError::WorkerCrashed(format!("SQLite worker {} exited {during}", self.index))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
        during: &'static str,
    ) -> Result<T, SqlAccessError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| self.crashed(during))?
    }

    /// Run one statement and return the raw worker reply.
    pub(crate) async fn execute(
        &self,
        message: WorkerMessage,
    ) -> Result<WorkerResult, SqlAccessError> {
        let Some(frame) = &self.frame else {
            let (tx, rx) = oneshot::channel();
            self.send(Command::Execute {
                message,
                respond_to: tx,
            })?;
            return rx
                .await
                .map_err(|_| self.crashed("while executing a statement"));
        };

        lock(frame).write(&message)?;
        self.request(
            |respond_to| Command::Framed { respond_to },
            "while executing a framed statement",
        )
        .await?;
        lock(frame).read()
    }

    pub(crate) async fn execute_batch(&self, sql: String) -> Result<(), SqlAccessError> {
        self.request(
            |respond_to| Command::ExecuteBatch { sql, respond_to },
            "while executing a batch",
        )
        .await
    }

    pub(crate) async fn begin(&self) -> Result<(), SqlAccessError> {
        self.request(
            |respond_to| Command::Begin { respond_to },
            "while beginning a transaction",
        )
        .await
    }

    pub(crate) async fn commit(&self) -> Result<(), SqlAccessError> {
        self.request(
            |respond_to| Command::Commit { respond_to },
            "while committing a transaction",
        )
        .await
    }

    pub(crate) async fn rollback(&self) -> Result<(), SqlAccessError> {
        self.request(
            |respond_to| Command::Rollback { respond_to },
            "while rolling back a transaction",
        )
        .await
    }

    /// Queue a rollback without waiting for it. Commands are served in order, so the next
    /// user of this worker sees the rolled-back state.
    pub(crate) fn rollback_detached(&self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.sender.send(Command::Rollback { respond_to: tx });
    }

    /// Make the worker exit mid-call without replying.
    pub(crate) async fn crash(&self) -> Result<WorkerResult, SqlAccessError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Crash { _respond_to: tx })?;
        rx.await.map_err(|_| self.crashed("while executing a statement"))
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

fn lock(frame: &Mutex<FrameBuffer>) -> MutexGuard<'_, FrameBuffer> {
    frame.lock().unwrap_or_else(PoisonError::into_inner)
}
