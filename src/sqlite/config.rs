use std::path::PathBuf;
use std::time::Duration;

use crate::migration::{MigrationScript, MigrationSource};
use crate::worker::{BusyRetryPolicy, Transport};

/// Options for opening a database and its worker pool.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// File path or `file:` URI. Each worker opens its own connection, so in-memory databases are
    /// not shared between workers.
    pub db_path: String,
    pub worker_count: usize,
    pub busy_timeout: Duration,
    /// `PRAGMA wal_autocheckpoint`, in pages.
    pub wal_autocheckpoint: u32,
    /// `PRAGMA analysis_limit` applied before `PRAGMA optimize` when a connection closes.
    pub analysis_limit: u32,
    /// How long a pooled connection may stay idle before it is closed.
    pub idle_timeout: Duration,
    pub migrations: MigrationSource,
    pub busy_retry: BusyRetryPolicy,
    pub transport: Transport,
    /// Largest key batch a data loader sends in one statement.
    pub max_batch_size: usize,
    pub change_channel_capacity: usize,
    /// Attach SQL text to errors returned by workers.
    pub expose_sql_in_errors: bool,
}

impl SqliteOptions {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            worker_count: std::thread::available_parallelism().map_or(1, usize::from),
            busy_timeout: Duration::from_secs(10),
            wal_autocheckpoint: 512,
            analysis_limit: 1024,
            idle_timeout: Duration::from_secs(10 * 60),
            migrations: MigrationSource::None,
            busy_retry: BusyRetryPolicy::default(),
            transport: Transport::Direct,
            max_batch_size: 128,
            change_channel_capacity: 256,
            expose_sql_in_errors: cfg!(debug_assertions),
        }
    }

    #[must_use]
    pub fn builder(db_path: impl Into<String>) -> SqliteOptionsBuilder {
        SqliteOptionsBuilder::new(db_path)
    }
}

/// Fluent builder for `SQLite` options.
#[derive(Debug, Clone)]
pub struct SqliteOptionsBuilder {
    opts: SqliteOptions,
}

impl SqliteOptionsBuilder {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            opts: SqliteOptions::new(db_path),
        }
    }

    /// Number of worker threads; values below one are raised to one.
    #[must_use]
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.opts.worker_count = worker_count.max(1);
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.opts.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn wal_autocheckpoint(mut self, pages: u32) -> Self {
        self.opts.wal_autocheckpoint = pages;
        self
    }

    #[must_use]
    pub fn analysis_limit(mut self, limit: u32) -> Self {
        self.opts.analysis_limit = limit;
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.opts.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.opts.migrations = MigrationSource::Directory(dir.into());
        self
    }

    #[must_use]
    pub fn migration_scripts(mut self, scripts: Vec<MigrationScript>) -> Self {
        self.opts.migrations = MigrationSource::Scripts(scripts);
        self
    }

    #[must_use]
    pub fn busy_retry(mut self, policy: BusyRetryPolicy) -> Self {
        self.opts.busy_retry = policy;
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Transport) -> Self {
        self.opts.transport = transport;
        self
    }

    #[must_use]
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.opts.max_batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn change_channel_capacity(mut self, capacity: usize) -> Self {
        self.opts.change_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn expose_sql_in_errors(mut self, expose: bool) -> Self {
        self.opts.expose_sql_in_errors = expose;
        self
    }

    #[must_use]
    pub fn finish(self) -> SqliteOptions {
        self.opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_sizes() {
        let opts = SqliteOptions::builder("db.sqlite")
            .worker_count(0)
            .max_batch_size(0)
            .transport(Transport::SharedBuffer { capacity: 4096 })
            .finish();
        assert_eq!(opts.worker_count, 1);
        assert_eq!(opts.max_batch_size, 1);
        assert_eq!(opts.wal_autocheckpoint, 512);
        assert_eq!(opts.transport, Transport::SharedBuffer { capacity: 4096 });
    }
}
