use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use super::config::SqliteOptions;
use crate::error::SqlAccessError;
use crate::migration::{MigrationReport, Migrator};

/// Open a connection and apply the per-connection pragmas.
///
/// # Errors
/// Returns the driver error if the file cannot be opened or a pragma fails.
pub fn open_connection(options: &SqliteOptions) -> Result<Connection, SqlAccessError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(&options.db_path, flags)?;
    conn.busy_timeout(options.busy_timeout)?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA wal_autocheckpoint = {};
         PRAGMA trusted_schema = ON;
         PRAGMA foreign_keys = ON;",
        options.wal_autocheckpoint
    ))?;
    debug!(path = %options.db_path, "opened sqlite connection");
    Ok(conn)
}

/// Open a connection and bring the schema up to date.
///
/// # Errors
/// Returns the open error or [`SqlAccessError::Migration`] if a migration fails.
pub fn open_migrated(
    options: &SqliteOptions,
    migrator: &Migrator,
) -> Result<(Connection, MigrationReport), SqlAccessError> {
    let mut conn = open_connection(options)?;
    let report = migrator.run(&mut conn)?;
    if !report.applied.is_empty() {
        debug!(from = report.from, to = report.to, "schema migrated");
    }
    Ok((conn, report))
}

/// Checkpoint the WAL and refresh planner statistics.
///
/// # Errors
/// Returns the driver error raised by any of the pragmas.
pub fn checkpoint_and_optimize(
    conn: &Connection,
    analysis_limit: u32,
) -> Result<(), SqlAccessError> {
    conn.execute_batch(&format!(
        "PRAGMA wal_checkpoint(PASSIVE);
         PRAGMA analysis_limit = {analysis_limit};
         PRAGMA optimize;"
    ))?;
    Ok(())
}

/// Checkpoint, optimize and close a connection.
///
/// # Errors
/// Returns the driver error if the pragmas or the close fail.
pub fn close_connection(conn: Connection, analysis_limit: u32) -> Result<(), SqlAccessError> {
    checkpoint_and_optimize(&conn, analysis_limit)?;
    conn.close().map_err(|(_, err)| SqlAccessError::SqliteError(err))?;
    debug!("closed sqlite connection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_pragmas_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pragmas.sqlite");
        let opts = SqliteOptions::builder(path.to_string_lossy()).finish();
        let conn = open_connection(&opts).expect("open");

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode, "wal");
        let fks: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .expect("foreign_keys");
        assert_eq!(fks, 1);
        let checkpoint: i64 = conn
            .query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))
            .expect("wal_autocheckpoint");
        assert_eq!(checkpoint, 512);

        close_connection(conn, opts.analysis_limit).expect("close");
    }
}
