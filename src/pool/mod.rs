//! Lazily opened, idle-evicted connections.
//!
//! Each connection runs on its own worker thread, so a checked-out [`PooledConnection`] keeps
//! statement order FIFO and can hold a transaction across calls. Checkout prefers the most
//! recently released idle connection; a new one is opened (and migrated) only when none is idle.
//! A released connection that stays idle for `idle_timeout` is checkpointed, optimized and closed.

mod connection;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;

use tracing::{debug, warn};

pub use connection::PooledConnection;

use crate::cache::RequestCache;
use crate::changes::ChangeBus;
use crate::error::SqlAccessError;
use crate::migration::Migrator;
use crate::sqlite::{SqliteOptions, open_migrated};
use crate::worker::WorkerHandle;

/// One open connection and its worker thread.
pub(crate) struct ConnectionSlot {
    pub(crate) id: usize,
    pub(crate) handle: WorkerHandle,
    pub(crate) thread: Option<JoinHandle<()>>,
    pub(crate) cache: Arc<RequestCache>,
    releases: u64,
}

impl ConnectionSlot {
    /// Stop the worker; it checkpoints and optimizes before closing the handle.
    fn close(mut self, join: bool) {
        debug!(connection = self.id, "closing pooled sqlite connection");
        self.handle.shutdown();
        if join
            && let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!(connection = self.id, "pooled sqlite worker panicked while closing");
        }
    }
}

#[derive(Default)]
struct PoolState {
    idle: Vec<ConnectionSlot>,
    open: usize,
    next_id: usize,
    closed: bool,
}

pub(crate) struct PoolShared {
    options: SqliteOptions,
    migrator: Migrator,
    bus: ChangeBus,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Return a connection; arms its eviction timer.
    pub(crate) fn release(self: &Arc<Self>, mut slot: ConnectionSlot) {
        let mut state = self.lock();
        if state.closed {
            state.open = state.open.saturating_sub(1);
            drop(state);
            slot.close(false);
            return;
        }
        slot.releases += 1;
        let (id, releases) = (slot.id, slot.releases);
        state.idle.push(slot);
        drop(state);
        debug!(connection = id, "sqlite connection released");
        self.arm_eviction(id, releases);
    }

    /// Forget a connection whose worker died.
    pub(crate) fn discard(&self, slot: ConnectionSlot) {
        let mut state = self.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        warn!(connection = slot.id, "discarding crashed pooled sqlite connection");
        slot.close(false);
    }

    fn arm_eviction(self: &Arc<Self>, id: usize, releases: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let idle_timeout = self.options.idle_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.evict(id, releases);
            }
        });
    }

    /// Close `id` if it is still idle since the release that armed this timer.
    fn evict(&self, id: usize, releases: u64) {
        let mut state = self.lock();
        let Some(pos) = state
            .idle
            .iter()
            .position(|slot| slot.id == id && slot.releases == releases)
        else {
            return;
        };
        let slot = state.idle.swap_remove(pos);
        state.open = state.open.saturating_sub(1);
        drop(state);
        debug!(connection = id, "evicting idle sqlite connection");
        slot.close(false);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let idle = std::mem::take(&mut self.lock().idle);
        for slot in idle {
            slot.close(false);
        }
    }
}

/// Pool of lazily opened connections, each pinned to its own worker thread.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create an empty pool. Migrations are loaded now and applied by every new connection.
    ///
    /// # Errors
    /// Returns [`SqlAccessError::Migration`] if the migration source is invalid.
    pub fn new(options: SqliteOptions, bus: ChangeBus) -> Result<Self, SqlAccessError> {
        let migrator = options.migrations.load()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                options,
                migrator,
                bus,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.shared.options
    }

    #[must_use]
    pub fn bus(&self) -> &ChangeBus {
        &self.shared.bus
    }

    /// Connections currently open, idle or checked out.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.shared.lock().open
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.shared.lock().idle.len()
    }

    /// Check out a connection, reusing an idle one when possible.
    ///
    /// The connection's request cache is cleared on checkout.
    ///
    /// # Errors
    /// Returns [`SqlAccessError::ConnectionError`] after [`shutdown`](Self::shutdown), or the
    /// open/migration error of a new connection.
    pub async fn checkout(&self) -> Result<PooledConnection, SqlAccessError> {
        let id = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(SqlAccessError::ConnectionError(
                    "connection pool is shut down".into(),
                ));
            }
            if let Some(slot) = state.idle.pop() {
                drop(state);
                slot.cache.clear();
                debug!(connection = slot.id, "reusing idle sqlite connection");
                return Ok(PooledConnection::new(Arc::clone(&self.shared), slot));
            }
            state.open += 1;
            state.next_id += 1;
            state.next_id
        };

        match self.open(id).await {
            Ok(slot) => Ok(PooledConnection::new(Arc::clone(&self.shared), slot)),
            Err(err) => {
                let mut state = self.shared.lock();
                state.open = state.open.saturating_sub(1);
                Err(err)
            }
        }
    }

    async fn open(&self, id: usize) -> Result<ConnectionSlot, SqlAccessError> {
        let shared = Arc::clone(&self.shared);
        let (conn, report) =
            tokio::task::spawn_blocking(move || open_migrated(&shared.options, &shared.migrator))
                .await
                .map_err(|err| {
                    SqlAccessError::ConnectionError(format!("connection open task failed: {err}"))
                })??;
        debug!(connection = id, schema_version = report.to, "opened pooled sqlite connection");

        let (handle, thread) = WorkerHandle::spawn(id, 0, conn, &self.shared.options, None)?;
        let cache = Arc::new(RequestCache::new(self.shared.options.max_batch_size));
        self.shared.bus.register_cache(&cache);
        Ok(ConnectionSlot {
            id,
            handle,
            thread: Some(thread),
            cache,
            releases: 0,
        })
    }

    /// Check out a connection and start an immediate transaction on it.
    ///
    /// # Errors
    /// Returns checkout errors or the `BEGIN IMMEDIATE` error.
    pub async fn begin(&self) -> Result<PooledConnection, SqlAccessError> {
        let conn = self.checkout().await?;
        conn.begin().await?;
        Ok(conn)
    }

    /// Close every idle connection and refuse further checkouts. Connections still checked out
    /// are closed when they are released.
    ///
    /// # Errors
    /// Returns an error if the blocking close task panicked.
    pub async fn shutdown(&self) -> Result<(), SqlAccessError> {
        let idle = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.open = state.open.saturating_sub(state.idle.len());
            std::mem::take(&mut state.idle)
        };
        tokio::task::spawn_blocking(move || {
            for slot in idle {
                slot.close(true);
            }
        })
        .await
        .map_err(|err| {
            SqlAccessError::Other(format!("connection pool shutdown task failed: {err}"))
        })
    }
}
