use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::channel::{ChangeEvent, WorkerMessage};
use super::pool::{WorkerLease, WorkerPool};
use crate::cache::RequestCache;
use crate::changes::ChangeBus;
use crate::error::SqlAccessError;
use crate::migration::MigrationReport;
use crate::repository::{Executor, Repository};
use crate::results::ResultSet;
use crate::sqlite::SqliteOptions;
use crate::types::RowValues;

/// Handle over a started worker pool, its change bus and a shared request cache.
///
/// Cloning is cheap; every clone talks to the same workers.
#[derive(Clone)]
pub struct Database {
    pool: WorkerPool,
    bus: ChangeBus,
    cache: Arc<RequestCache>,
    report: Arc<MigrationReport>,
}

impl Database {
    /// Migrate the database and start the worker pool.
    ///
    /// # Errors
    /// Returns migration, open or spawn errors; see [`WorkerPool::start`].
    pub async fn open(options: SqliteOptions) -> Result<Self, SqlAccessError> {
        let bus = ChangeBus::new(options.change_channel_capacity);
        Self::open_with_bus(options, bus).await
    }

    /// Like [`open`](Self::open), publishing changes on an existing bus.
    ///
    /// # Errors
    /// See [`open`](Self::open).
    pub async fn open_with_bus(
        options: SqliteOptions,
        bus: ChangeBus,
    ) -> Result<Self, SqlAccessError> {
        let max_batch_size = options.max_batch_size;
        let (pool, report) = tokio::task::spawn_blocking(move || WorkerPool::start(options))
            .await
            .map_err(|err| {
                SqlAccessError::Other(format!("worker pool start task failed: {err}"))
            })??;
        let cache = Arc::new(RequestCache::new(max_batch_size));
        bus.register_cache(&cache);
        Ok(Self {
            pool,
            bus,
            cache,
            report: Arc::new(report),
        })
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Migrations applied when the pool started.
    #[must_use]
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }

    #[must_use]
    pub fn repository(&self) -> Repository<'_, Self> {
        Repository::new(self)
    }

    /// Run one statement on an idle worker and publish its change event.
    ///
    /// # Errors
    /// Returns the reconstituted worker error, [`SqlAccessError::WorkerCrashed`] if the worker
    /// died mid-call, or an encoding error from the shared-buffer transport.
    pub async fn run(
        &self,
        sql: &str,
        params: Vec<RowValues>,
    ) -> Result<ResultSet, SqlAccessError> {
        let reply = {
            let lease = self.pool.acquire().await?;
            lease.execute(WorkerMessage::new(sql, params)).await?
        };
        let (result_set, change) = reply.into_outcome()?;
        if let Some(change) = change {
            self.bus.publish(change);
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

    /// Run a statement and return the number of changed rows.
    ///
    /// # Errors
    /// See [`run`](Self::run).
    pub async fn execute(
        &self,
        sql: &str,
        params: Vec<RowValues>,
    ) -> Result<usize, SqlAccessError> {
        Ok(self.run(sql, params).await?.rows_affected)
    }

    /// Run a multi-statement script atomically. Batches publish no change events, so the shared
    /// cache is cleared as a whole afterwards.
    ///
    /// # Errors
    /// Returns the reconstituted worker error.
    pub async fn exec_batch(&self, sql: &str) -> Result<(), SqlAccessError> {
        let result = {
            let lease = self.pool.acquire().await?;
            lease.execute_batch(sql.to_owned()).await
        };
        self.cache.clear();
        result
    }

    /// Pin one worker and start an immediate transaction on it.
    ///
    /// # Errors
    /// Returns the error raised by `BEGIN IMMEDIATE` once busy retries are exhausted.
    pub async fn begin(&self) -> Result<Transaction, SqlAccessError> {
        let lease = self.pool.acquire().await?;
        lease.begin().await?;
        Ok(Transaction {
            lease,
            bus: self.bus.clone(),
            cache: RequestCache::new(self.cache.max_batch_size()),
            pending: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        })
    }

    /// Stop the workers, checkpointing and optimizing each connection.
    ///
    /// # Errors
    /// Returns an error if the blocking shutdown task panicked.
    pub async fn shutdown(&self) -> Result<(), SqlAccessError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || pool.shutdown())
            .await
            .map_err(|err| {
                SqlAccessError::Other(format!("worker pool shutdown task failed: {err}"))
            })
    }

    #[doc(hidden)]
    pub async fn crash_worker_for_tests(&self) -> Result<ResultSet, SqlAccessError> {
        let lease = self.pool.acquire().await?;
        lease.crash().await?.into_outcome().map(|(rs, _)| rs)
    }
}

#[async_trait]
impl Executor for Database {
    async fn run(&self, sql: &str, params: Vec<RowValues>) -> Result<ResultSet, SqlAccessError> {
        Database::run(self, sql, params).await
    }

    async fn exec_batch(&self, sql: &str) -> Result<(), SqlAccessError> {
        Database::exec_batch(self, sql).await
    }

    fn cache(&self) -> &RequestCache {
        &self.cache
    }
}

/// A transaction pinned to one worker. Dropping it without committing rolls back.
///
/// Change events are held back until commit, and are discarded on rollback.
pub struct Transaction {
    lease: WorkerLease,
    bus: ChangeBus,
    cache: RequestCache,
    pending: Mutex<Vec<ChangeEvent>>,
    finished: AtomicBool,
}

impl Transaction {
    #[must_use]
    pub fn repository(&self) -> Repository<'_, Self> {
        Repository::new(self)
    }

    /// # Errors
    /// Returns the reconstituted worker error or [`SqlAccessError::WorkerCrashed`].
    pub async fn run(
        &self,
        sql: &str,
        params: Vec<RowValues>,
    ) -> Result<ResultSet, SqlAccessError> {
        let reply = self.lease.execute(WorkerMessage::new(sql, params)).await?;
        let (result_set, change) = reply.into_outcome()?;
        if let Some(change) = change {
            self.cache.clear_table(&change.table);
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if !pending.contains(&change) {
                pending.push(change);
            }
        }
        Ok(result_set)
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
        let result = self.lease.execute_batch(sql.to_owned()).await;
        self.cache.clear();
        result
    }

    /// Commit and publish the buffered change events.
    ///
    /// # Errors
    /// Returns the commit error; the transaction is rolled back in that case.
    pub async fn commit(self) -> Result<(), SqlAccessError> {
        let committed = self.lease.commit().await;
        self.finished.store(true, Ordering::Release);
        committed?;
        let pending = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        debug!(changes = pending.len(), "transaction committed");
        for change in pending {
            self.bus.publish(change);
        }
        Ok(())
    }

    /// # Errors
    /// Returns the rollback error once busy retries are exhausted.
    pub async fn rollback(self) -> Result<(), SqlAccessError> {
        let rolled_back = self.lease.rollback().await;
        self.finished.store(true, Ordering::Release);
        rolled_back
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            debug!("transaction dropped without commit, rolling back");
            self.lease.rollback_detached();
        }
    }
}

#[async_trait]
impl Executor for Transaction {
    async fn run(&self, sql: &str, params: Vec<RowValues>) -> Result<ResultSet, SqlAccessError> {
        Transaction::run(self, sql, params).await
    }

    async fn exec_batch(&self, sql: &str) -> Result<(), SqlAccessError> {
        Transaction::exec_batch(self, sql).await
    }

    fn cache(&self) -> &RequestCache {
        &self.cache
    }
}
