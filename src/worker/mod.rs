//! Worker pool and wire protocol.
//!
//! Every worker is an OS thread that owns one connection to the database file and serves one
//! [`WorkerMessage`] at a time. Callers suspend on a oneshot reply; mutations come back with a
//! [`ChangeEvent`] that the [`Database`] handle publishes on its
//! [`ChangeBus`](crate::changes::ChangeBus).

mod channel;
pub mod classify;
mod database;
mod dispatcher;
mod manager;
mod pool;
pub mod retry;
pub mod wire;

pub use channel::{ChangeEvent, ChangeKind, WireError, WorkerData, WorkerMessage, WorkerResult};
pub use classify::classify_statement;
pub use database::{Database, Transaction};
pub use pool::WorkerPool;
pub use retry::BusyRetryPolicy;
pub use wire::{FrameBuffer, Transport};

pub(crate) use manager::WorkerHandle;
