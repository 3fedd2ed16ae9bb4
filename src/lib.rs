//! Embedded SQLite access layer.
//!
//! - [`expr`] and [`query_builder`] compose parameterized statements from a typed expression
//!   tree.
//! - [`migration`] applies versioned `v<N>.sql` scripts, expanding FTS and timestamp trigger
//!   macros.
//! - [`worker`] serializes statements onto a fixed pool of connection-owning threads.
//! - [`changes`] broadcasts the table touched by every mutation; [`cache`] drops stale entries
//!   on it.
//! - [`pool`] hands out lazily opened connections for callers that need one pinned handle.
//! - [`repository`] is the query API on top of any of them.
//!
//! ```rust,no_run
//! use sqlite_access::prelude::*;
//!
//! # async fn demo() -> Result<(), SqlAccessError> {
//! let options = SqliteOptions::builder("app.sqlite")
//!     .migrations_dir("migrations")
//!     .finish();
//! let db = Database::open(options).await?;
//! let rows = db
//!     .repository()
//!     .find_many(
//!         &Selector::new()
//!             .from("categories")
//!             .filter(eq(SqlField::new("name"), "Science")),
//!     )
//!     .await?;
//! println!("{} rows", rows.len());
//! db.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod changes;
pub mod entity;
pub mod error;
pub mod expr;
pub mod fts;
pub mod migration;
pub mod placeholders;
pub mod pool;
pub mod prelude;
pub mod query_builder;
pub mod repository;
pub mod results;
pub mod sqlite;
pub mod types;
pub mod worker;

pub use error::SqlAccessError;
pub use results::{CustomDbRow, ResultSet};
pub use types::{EntityId, RowValues};
