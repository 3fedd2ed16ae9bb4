use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::channel::{WorkerMessage, WorkerResult};
use super::manager::{ExitNotice, SupervisorEvent, WorkerHandle};
use crate::error::SqlAccessError;
use crate::migration::MigrationReport;
use crate::sqlite::{SqliteOptions, close_connection, open_connection, open_migrated};

const RESPAWN_BACKOFF_START: Duration = Duration::from_millis(50);
const RESPAWN_BACKOFF_MAX: Duration = Duration::from_secs(5);

struct Slot {
    handle: Option<WorkerHandle>,
    thread: Option<JoinHandle<()>>,
    in_use: bool,
    generation: u64,
}

struct PoolShared {
    options: SqliteOptions,
    slots: Vec<Mutex<Slot>>,
    permits: Arc<Semaphore>,
    available: Notify,
    events: Sender<SupervisorEvent>,
    closed: AtomicBool,
    respawns: AtomicUsize,
}

/// Fixed set of worker threads, each owning one connection to the same database file.
///
/// Callers wait in FIFO order for a permit; a permit always maps to an idle, live worker, so a
/// busy worker never receives a second message.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Migrate the database, then spawn `options.worker_count` workers.
    ///
    /// Blocks while migrations run; call from a blocking context.
    ///
    /// # Errors
    /// Returns migration errors, connection open errors or thread spawn failures.
    pub fn start(options: SqliteOptions) -> Result<(Self, MigrationReport), SqlAccessError> {
        let migrator = options.migrations.load()?;
        let (setup, report) = open_migrated(&options, &migrator)?;
        close_connection(setup, options.analysis_limit)?;

        let (events, receiver) = mpsc::channel();
        let worker_count = options.worker_count.max(1);
        let mut slots = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let conn = open_connection(&options)?;
            let (handle, thread) =
                WorkerHandle::spawn(index, 0, conn, &options, Some(events.clone()))?;
            slots.push(Mutex::new(Slot {
                handle: Some(handle),
                thread: Some(thread),
                in_use: false,
                generation: 0,
            }));
        }

        let shared = Arc::new(PoolShared {
            permits: Arc::new(Semaphore::new(worker_count)),
            available: Notify::new(),
            events,
            closed: AtomicBool::new(false),
            respawns: AtomicUsize::new(0),
            slots,
            options,
        });
        spawn_supervisor(Arc::downgrade(&shared), receiver)?;
        info!(
            workers = worker_count,
            path = %shared.options.db_path,
            version = report.to,
            "sqlite worker pool started"
        );
        Ok((Self { shared }, report))
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.shared.options
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.slots.len()
    }

    /// Workers replaced after a crash since the pool started.
    #[must_use]
    pub fn respawn_count(&self) -> usize {
        self.shared.respawns.load(Ordering::Acquire)
    }

    /// Wait for an idle worker and reserve it until the lease is dropped.
    ///
    /// # Errors
    /// Returns [`SqlAccessError::ConnectionError`] once the pool is shut down.
    pub(crate) async fn acquire(&self) -> Result<WorkerLease, SqlAccessError> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| pool_closed())?;
        loop {
            let notified = self.shared.available.notified();
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(pool_closed());
            }
            if let Some(handle) = self.shared.claim_idle() {
                return Ok(WorkerLease {
                    shared: Arc::clone(&self.shared),
                    handle,
                    dead: AtomicBool::new(false),
                    _permit: permit,
                });
            }
            // Only reachable while a crashed worker is being replaced.
            notified.await;
        }
    }

    /// Stop every worker and wait for them to close their connections.
    pub fn shutdown(&self) {
        let threads = self.shared.close();
        for thread in threads {
            if thread.join().is_err() {
                warn!("sqlite worker thread panicked during shutdown");
            }
        }
        info!("sqlite worker pool shut down");
    }
}

impl PoolShared {
    fn claim_idle(&self) -> Option<WorkerHandle> {
        self.slots.iter().find_map(|slot| {
            let mut slot = lock(slot);
            if slot.in_use {
                return None;
            }
            let handle = slot.handle.clone()?;
            slot.in_use = true;
            Some(handle)
        })
    }

    /// Mark the pool closed and ask every worker to exit. Returns their threads.
    fn close(&self) -> Vec<JoinHandle<()>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.permits.close();
        let mut threads = Vec::new();
        for slot in &self.slots {
            let mut slot = lock(slot);
            if let Some(handle) = slot.handle.take() {
                handle.shutdown();
            }
            threads.extend(slot.thread.take());
        }
        let _ = self.events.send(SupervisorEvent::Stop);
        self.available.notify_waiters();
        threads
    }

    fn replace_worker(&self, notice: ExitNotice) {
        let mut backoff = RESPAWN_BACKOFF_START;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            {
                let mut slot = lock(&self.slots[notice.index]);
                if slot.generation != notice.generation {
                    return;
                }
                slot.handle = None;
                slot.thread = None;
            }

            let generation = notice.generation + 1;
            let spawned = open_connection(&self.options).and_then(|conn| {
                WorkerHandle::spawn(
                    notice.index,
                    generation,
                    conn,
                    &self.options,
                    Some(self.events.clone()),
                )
            });
            match spawned {
                Ok((handle, thread)) => {
                    {
                        let mut slot = lock(&self.slots[notice.index]);
                        slot.handle = Some(handle);
                        slot.thread = Some(thread);
                        slot.generation = generation;
                        slot.in_use = false;
                    }
                    self.respawns.fetch_add(1, Ordering::AcqRel);
                    info!(index = notice.index, generation, "replaced crashed sqlite worker");
                    self.available.notify_waiters();
                    return;
                }
                Err(err) => {
                    error!(index = notice.index, error = %err, "failed to replace sqlite worker");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(RESPAWN_BACKOFF_MAX);
                }
            }
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        // Threads are detached here; `WorkerPool::shutdown` is the joining path.
        let _ = self.close();
    }
}

fn spawn_supervisor(
    shared: Weak<PoolShared>,
    receiver: Receiver<SupervisorEvent>,
) -> Result<(), SqlAccessError> {
    thread::Builder::new()
        .name("sqlite-supervisor".into())
        .spawn(move || {
            while let Ok(SupervisorEvent::Exited(notice)) = receiver.recv() {
                if !notice.crashed {
                    continue;
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.closed.load(Ordering::Acquire) {
                    continue;
                }
                error!(
                    index = notice.index,
                    generation = notice.generation,
                    "sqlite worker crashed"
                );
                shared.replace_worker(notice);
            }
            debug!("sqlite supervisor stopped");
        })
        .map(|_| ())
        .map_err(|err| {
            SqlAccessError::ConnectionError(format!("failed to spawn supervisor thread: {err}"))
        })
}

/// Exclusive use of one worker; released on drop.
pub(crate) struct WorkerLease {
    shared: Arc<PoolShared>,
    handle: WorkerHandle,
    dead: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    fn observe<T>(&self, result: Result<T, SqlAccessError>) -> Result<T, SqlAccessError> {
        if matches!(result, Err(SqlAccessError::WorkerCrashed(_))) {
            self.dead.store(true, Ordering::Release);
        }
        result
    }

    pub(crate) async fn execute(
        &self,
        message: WorkerMessage,
    ) -> Result<WorkerResult, SqlAccessError> {
        self.observe(self.handle.execute(message).await)
    }

    pub(crate) async fn execute_batch(&self, sql: String) -> Result<(), SqlAccessError> {
        self.observe(self.handle.execute_batch(sql).await)
    }

    pub(crate) async fn begin(&self) -> Result<(), SqlAccessError> {
        self.observe(self.handle.begin().await)
    }

    pub(crate) async fn commit(&self) -> Result<(), SqlAccessError> {
        self.observe(self.handle.commit().await)
    }

    pub(crate) async fn rollback(&self) -> Result<(), SqlAccessError> {
        self.observe(self.handle.rollback().await)
    }

    pub(crate) fn rollback_detached(&self) {
        self.handle.rollback_detached();
    }

    pub(crate) async fn crash(&self) -> Result<WorkerResult, SqlAccessError> {
        self.observe(self.handle.crash().await)
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        {
            let mut slot = lock(&self.shared.slots[self.handle.index()]);
            if slot.generation == self.handle.generation() {
                slot.in_use = false;
                // Keep the dead worker out of rotation until the supervisor replaces it.
                if self.dead.load(Ordering::Acquire) {
                    slot.handle = None;
                }
            }
        }
        self.shared.available.notify_waiters();
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pool_closed() -> SqlAccessError {
    SqlAccessError::ConnectionError("SQLite worker pool is shut down".into())
}
