use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{ConnectionSlot, PoolShared};
use crate::cache::RequestCache;
use crate::error::SqlAccessError;
use crate::repository::{Executor, Repository};
use crate::results::ResultSet;
use crate::types::RowValues;
use crate::worker::{ChangeEvent, WorkerMessage};

/// A checked-out connection. Never shared between callers; dropping it returns it to the pool.
///
/// While a transaction is open, change events are buffered and published on commit. Dropping
/// the connection with a transaction still open rolls it back.
pub struct PooledConnection {
    shared: Arc<PoolShared>,
    slot: Option<ConnectionSlot>,
    cache: Arc<RequestCache>,
    pending: Mutex<Vec<ChangeEvent>>,
    in_transaction: AtomicBool,
    broken: AtomicBool,
}

impl PooledConnection {
    pub(crate) fn new(shared: Arc<PoolShared>, slot: ConnectionSlot) -> Self {
        Self {
            shared,
            cache: Arc::clone(&slot.cache),
            slot: Some(slot),
            pending: Mutex::new(Vec::new()),
            in_transaction: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }
    }

    fn slot(&self) -> Result<&ConnectionSlot, SqlAccessError> {
        self.slot
            .as_ref()
            .ok_or_else(|| SqlAccessError::ConnectionError("connection already released".into()))
    }

    fn pending(&self) -> MutexGuard<'_, Vec<ChangeEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe<T>(&self, result: Result<T, SqlAccessError>) -> Result<T, SqlAccessError> {
        if let Err(SqlAccessError::WorkerCrashed(_)) = &result {
            self.broken.store(true, Ordering::Release);
        }
        result
    }

    /// Pool-assigned connection number.
    #[must_use]
    pub fn id(&self) -> Option<usize> {
        self.slot.as_ref().map(|slot| slot.id)
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn repository(&self) -> Repository<'_, Self> {
        Repository::new(self)
    }

    /// Run one statement on this connection.
    ///
    /// # Errors
    /// Returns the reconstituted worker error or [`SqlAccessError::WorkerCrashed`].
    pub async fn run(
        &self,
        sql: &str,
        params: Vec<RowValues>,
    ) -> Result<ResultSet, SqlAccessError> {
        let slot = self.slot()?;
        let reply = self.observe(slot.handle.execute(WorkerMessage::new(sql, params)).await)?;
        let (result_set, change) = reply.into_outcome()?;
        if let Some(change) = change {
            if self.in_transaction() {
                self.cache.clear_table(&change.table);
                let mut pending = self.pending();
                if !pending.contains(&change) {
                    pending.push(change);
                }
            } else {
                self.shared.bus().publish(change);
            }
        }
        Ok(result_set)
    }

    /// # Errors
    /// See [`run`](Self::run).
    pub async fn query(
        &self,
        sql: &str,
        params: Vec<RowValues>,
    ) -> Result<ResultSet, SqlAccessError> {
        self.run(sql, params).await
    }

    /// # Errors
    /// See [`run`](Self::run).
    pub async fn execute(
        &self,
        sql: &str,
        params: Vec<RowValues>,
    ) -> Result<usize, SqlAccessError> {
        Ok(self.run(sql, params).await?.rows_affected)
    }

    /// # Errors
    /// Returns the reconstituted worker error.
    pub async fn exec_batch(&self, sql: &str) -> Result<(), SqlAccessError> {
        let slot = self.slot()?;
        let result = self.observe(slot.handle.execute_batch(sql.to_owned()).await);
        self.cache.clear();
        result
    }

    /// Start an immediate transaction pinned to this connection.
    ///
    /// # Errors
    /// Returns the `BEGIN IMMEDIATE` error once busy retries are exhausted.
    pub async fn begin(&self) -> Result<(), SqlAccessError> {
        let slot = self.slot()?;
        self.observe(slot.handle.begin().await)?;
        self.in_transaction.store(true, Ordering::Release);
        Ok(())
    }

    /// Commit and publish the changes buffered during the transaction.
    ///
    /// # Errors
    /// Returns the commit error; the transaction is rolled back in that case.
    pub async fn commit(&self) -> Result<(), SqlAccessError> {
        let slot = self.slot()?;
        let committed = self.observe(slot.handle.commit().await);
        self.in_transaction.store(false, Ordering::Release);
        let pending = std::mem::take(&mut *self.pending());
        if let Err(err) = committed {
            self.cache.clear();
            return Err(err);
        }
        debug!(changes = pending.len(), "pooled transaction committed");
        for change in pending {
            self.shared.bus().publish(change);
        }
        Ok(())
    }

    /// # Errors
    /// Returns the rollback error once busy retries are exhausted.
    pub async fn rollback(&self) -> Result<(), SqlAccessError> {
        let slot = self.slot()?;
        let rolled_back = self.observe(slot.handle.rollback().await);
        self.in_transaction.store(false, Ordering::Release);
        self.pending().clear();
        self.cache.clear();
        rolled_back
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if self.broken.load(Ordering::Acquire) {
            self.shared.discard(slot);
            return;
        }
        if self.in_transaction.load(Ordering::Acquire) {
            debug!(connection = slot.id, "connection released inside a transaction, rolling back");
            slot.handle.rollback_detached();
        }
        self.shared.release(slot);
    }
}

#[async_trait]
impl Executor for PooledConnection {
    async fn run(&self, sql: &str, params: Vec<RowValues>) -> Result<ResultSet, SqlAccessError> {
        PooledConnection::run(self, sql, params).await
    }

    async fn exec_batch(&self, sql: &str) -> Result<(), SqlAccessError> {
        PooledConnection::exec_batch(self, sql).await
    }

    fn cache(&self) -> &RequestCache {
        &self.cache
    }
}
