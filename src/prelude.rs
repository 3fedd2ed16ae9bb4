//! Convenient imports for common functionality.

pub use crate::cache::{DataLoader, RequestCache};
pub use crate::changes::{ChangeBus, ChangeNotice, ChangeStream};
pub use crate::entity::{IdStrategy, Record, SqlEntity};
pub use crate::error::SqlAccessError;
pub use crate::expr::{
    Operand, SqlExpr, SqlField, SqlOperator, and, assign, eq, gt, gt_eq, in_expr, in_list,
    is_not_null, is_null, lt, lt_eq, neq, not, or,
};
pub use crate::fts::sanitize_web_search;
pub use crate::migration::{FtsKind, MigrationReport, MigrationScript, MigrationSource, Migrator};
pub use crate::pool::{ConnectionPool, PooledConnection};
pub use crate::query_builder::{
    BuildError, Deleter, Direction, Inserter, Nulls, Selection, Selector, Statement, Updater,
};
pub use crate::repository::{Executor, N2mLink, Page, PageRequest, Repository, TableAccess};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::sqlite::{SqliteOptions, SqliteOptionsBuilder};
pub use crate::types::{EntityId, RowValues};
pub use crate::worker::{
    BusyRetryPolicy, ChangeEvent, ChangeKind, Database, Transaction, Transport,
};
