//! Execution seam between planned SQL and a database driver.

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

use async_trait::async_trait;
use geostore_core::Attributes;

#[cfg(feature = "postgres")]
pub use postgres::PostgresExecutor;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExecutor;

/// One result row, keyed by result column name.
pub type Row = Attributes;

/// Runs SQL text produced by the planner.
///
/// Implementations never retry: a failed or cancelled statement is reported
/// to the caller as is.
///
/// Used as `Arc<dyn SqlExecutor>`.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Runs a statement returning rows (`SELECT`, `... RETURNING`).
    async fn query(&self, sql: &str) -> anyhow::Result<Vec<Row>>;

    /// Runs a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str) -> anyhow::Result<u64>;

    /// Runs all statements in one database transaction, returning the rows
    /// each produced. Either every statement takes effect or none does.
    async fn execute_batch(&self, statements: &[String]) -> anyhow::Result<Vec<Vec<Row>>>;

    /// Asks the statement in flight to stop. Returns `true` if the request
    /// was delivered: the statement's future then still resolves, with an
    /// error if it stopped, and its effects are settled once it does.
    ///
    /// Executors whose work stops when the future is dropped keep the
    /// default.
    fn interrupt(&self) -> bool {
        false
    }
}
