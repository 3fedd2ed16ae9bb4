use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::Connection;
use rusqlite::types::Value;
use tracing::{trace, warn};

use super::channel::{Command, WireError, WorkerData, WorkerMessage, WorkerResult};
use super::classify::classify_statement;
use super::retry::BusyRetryPolicy;
use super::wire::FrameBuffer;
use crate::error::SqlAccessError;
use crate::placeholders::leading_keyword;
use crate::sqlite::{Params, close_connection, collect_rows};

/// Per-worker settings captured at spawn time.
pub(super) struct WorkerContext {
    pub(super) retry: BusyRetryPolicy,
    pub(super) expose_sql: bool,
    pub(super) analysis_limit: u32,
    pub(super) frame: Option<Arc<Mutex<FrameBuffer>>>,
}

impl WorkerContext {
    fn wire_error(&self, err: &rusqlite::Error, sql: &str, attempts: usize) -> WireError {
        let mut wire = WireError::from_sqlite(err);
        wire.attempts = attempts;
        if self.expose_sql {
            wire.sql = Some(sql.to_owned());
        }
        wire
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WorkerExit {
    Clean,
    Crashed,
}

enum TxExit {
    Finished,
    Shutdown,
    Crashed,
}

pub(super) fn run_worker(
    conn: Connection,
    receiver: &Receiver<Command>,
    ctx: &WorkerContext,
) -> WorkerExit {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Shutdown => break,
            Command::Crash { .. } => return WorkerExit::Crashed,
            Command::Execute {
                message,
                respond_to,
            } => {
                let _ = respond_to.send(execute(&conn, &message, ctx));
            }
            Command::Framed { respond_to } => {
                let _ = respond_to.send(execute_framed(&conn, ctx));
            }
            Command::ExecuteBatch { sql, respond_to } => {
                let _ = respond_to.send(execute_batch(&conn, &sql, ctx));
            }
            Command::Begin { respond_to } => {
                let (result, attempts) = ctx
                    .retry
                    .run_blocking(|| conn.execute_batch("BEGIN IMMEDIATE"));
                match result {
                    Ok(()) => {
                        let _ = respond_to.send(Ok(()));
                        // Every command is served inside the transaction until it ends.
                        match run_tx_loop(&conn, receiver, ctx) {
                            TxExit::Finished => {}
                            TxExit::Shutdown => break,
                            TxExit::Crashed => return WorkerExit::Crashed,
                        }
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(ctx
                            .wire_error(&err, "BEGIN IMMEDIATE", attempts)
                            .into_error()));
                    }
                }
            }
            Command::Commit { respond_to } | Command::Rollback { respond_to } => {
                let _ = respond_to.send(Err(SqlAccessError::ExecutionError(
                    "No active SQLite transaction".into(),
                )));
            }
        }
    }

    if let Err(err) = close_connection(conn, ctx.analysis_limit) {
        warn!(error = %err, "failed to close sqlite connection cleanly");
    }
    WorkerExit::Clean
}

fn run_tx_loop(conn: &Connection, receiver: &Receiver<Command>, ctx: &WorkerContext) -> TxExit {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Execute {
                message,
                respond_to,
            } => {
                let _ = respond_to.send(execute(conn, &message, ctx));
            }
            Command::Framed { respond_to } => {
                let _ = respond_to.send(execute_framed(conn, ctx));
            }
            Command::ExecuteBatch { sql, respond_to } => {
                let _ = respond_to.send(execute_batch(conn, &sql, ctx));
            }
            Command::Begin { respond_to } => {
                let _ = respond_to.send(Err(SqlAccessError::ExecutionError(
                    "SQLite transaction already in progress".into(),
                )));
            }
            Command::Commit { respond_to } => {
                let (result, attempts) = ctx.retry.run_blocking(|| conn.execute_batch("COMMIT"));
                let reply = match result {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        let _ = rollback(conn, ctx);
                        Err(ctx.wire_error(&err, "COMMIT", attempts).into_error())
                    }
                };
                let _ = respond_to.send(reply);
                return TxExit::Finished;
            }
            Command::Rollback { respond_to } => {
                let _ = respond_to.send(rollback(conn, ctx));
                return TxExit::Finished;
            }
            Command::Shutdown => {
                let _ = rollback(conn, ctx);
                return TxExit::Shutdown;
            }
            Command::Crash { .. } => return TxExit::Crashed,
        }
    }
    let _ = rollback(conn, ctx);
    TxExit::Shutdown
}

fn rollback(conn: &Connection, ctx: &WorkerContext) -> Result<(), SqlAccessError> {
    if conn.is_autocommit() {
        return Ok(());
    }
    let (result, attempts) = ctx.retry.run_blocking(|| conn.execute_batch("ROLLBACK"));
    result.map_err(|err| ctx.wire_error(&err, "ROLLBACK", attempts).into_error())
}

pub(super) fn execute(
    conn: &Connection,
    message: &WorkerMessage,
    ctx: &WorkerContext,
) -> WorkerResult {
    if leading_keyword(&message.sql).is_none_or(|(_, word)| word != "PRAGMA") {
        trace!(sql = %message.sql, params = message.params.len(), "executing statement");
    }
    let params = Params::convert(&message.params);
    let (result, attempts) = ctx
        .retry
        .run_blocking(|| run_statement(conn, &message.sql, &params.0));
    match result {
        Ok(data) => WorkerResult {
            error: None,
            data: Some(data),
            change: classify_statement(&message.sql),
        },
        Err(err) => WorkerResult::failed(ctx.wire_error(&err, &message.sql, attempts)),
    }
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[Value],
) -> Result<WorkerData, rusqlite::Error> {
    let mut stmt = conn.prepare_cached(sql)?;
    if stmt.column_count() > 0 {
        let (rows, columns) = collect_rows(&mut stmt, params)?;
        return Ok(WorkerData::Rows { rows, columns });
    }
    let param_refs: Vec<&dyn rusqlite::ToSql> =
        params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    Ok(WorkerData::Affected(stmt.execute(&param_refs[..])?))
}

fn execute_framed(conn: &Connection, ctx: &WorkerContext) -> Result<(), SqlAccessError> {
    let frame = ctx
        .frame
        .as_ref()
        .ok_or_else(|| SqlAccessError::Encoding("worker has no shared buffer".into()))?;
    let mut buffer = frame.lock().unwrap_or_else(PoisonError::into_inner);
    let message: WorkerMessage = buffer.read()?;
    let result = execute(conn, &message, ctx);
    buffer.write(&result)?;
    Ok(())
}

/// Run a multi-statement script. Outside a transaction the script runs atomically.
fn execute_batch(conn: &Connection, sql: &str, ctx: &WorkerContext) -> Result<(), SqlAccessError> {
    let standalone = conn.is_autocommit();
    let (result, attempts) = ctx.retry.run_blocking(|| {
        if !standalone {
            return conn.execute_batch(sql);
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match conn.execute_batch(sql).and_then(|()| conn.execute_batch("COMMIT")) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    });
    result.map_err(|err| ctx.wire_error(&err, sql, attempts).into_error())
}
