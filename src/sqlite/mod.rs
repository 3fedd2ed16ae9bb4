// SQLite plumbing shared by the worker pool, the connection pool and the migration runner:
// - config: options and their fluent builder
// - connection: open/close with the required pragmas
// - params: `RowValues` to driver values
// - query: row extraction

pub mod config;
pub mod connection;
pub mod params;
pub mod query;

pub use config::{SqliteOptions, SqliteOptionsBuilder};
pub use connection::{checkpoint_and_optimize, close_connection, open_connection, open_migrated};
pub use params::Params;
pub use query::collect_rows;
