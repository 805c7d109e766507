//! `SQLite` executor over a single `rusqlite` connection.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use geostore_core::{Attributes, Value};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle};

use super::{Row, SqlExecutor};

/// Serializes access to one connection and runs statements on the blocking
/// pool.
#[derive(Clone)]
pub struct SqliteExecutor {
    connection: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteExecutor {
    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot open the database.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let connection = Connection::open_in_memory().context("open in-memory sqlite database")?;
        Ok(Self::from_connection(connection))
    }

    /// Opens (or creates) a database file.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot open the file.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let connection =
            Connection::open(path).with_context(|| format!("open sqlite database {}", path.display()))?;
        Ok(Self::from_connection(connection))
    }

    #[must_use]
    pub fn from_connection(connection: Connection) -> Self {
        Self {
            interrupt: Arc::new(connection.get_interrupt_handle()),
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    /// Runs a multi-statement script, e.g. schema setup.
    ///
    /// # Errors
    ///
    /// Returns the first failing statement's error.
    pub async fn run_script(&self, script: &str) -> anyhow::Result<()> {
        let script = script.to_string();
        self.with_connection(move |conn| conn.execute_batch(&script).context("run sqlite script"))
            .await
    }

    async fn with_connection<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut conn = connection.lock();
            f(&mut conn)
        })
        .await
        .context("sqlite worker task failed")?
    }
}

impl std::fmt::Debug for SqliteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn query(&self, sql: &str) -> anyhow::Result<Vec<Row>> {
        let sql = sql.to_string();
        self.with_connection(move |conn| fetch_rows(conn, &sql)).await
    }

    async fn execute(&self, sql: &str) -> anyhow::Result<u64> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            let affected = conn.execute(&sql, []).with_context(|| format!("execute: {sql}"))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn execute_batch(&self, statements: &[String]) -> anyhow::Result<Vec<Vec<Row>>> {
        let statements = statements.to_vec();
        self.with_connection(move |conn| {
            let tx = conn.transaction().context("begin sqlite transaction")?;
            let mut results = Vec::with_capacity(statements.len());
            for sql in &statements {
                results.push(fetch_rows(&tx, sql)?);
            }
            tx.commit().context("commit sqlite transaction")?;
            Ok(results)
        })
        .await
    }

    /// Interrupts whichever statement currently holds the connection; an
    /// interrupted batch rolls back.
    fn interrupt(&self) -> bool {
        self.interrupt.interrupt();
        true
    }
}

fn fetch_rows(conn: &Connection, sql: &str) -> anyhow::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql).with_context(|| format!("prepare: {sql}"))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query([]).with_context(|| format!("query: {sql}"))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut attributes = Attributes::new();
        for (i, name) in names.iter().enumerate() {
            attributes.set(name.as_str(), to_value(row.get_ref(i)?));
        }
        out.push(attributes);
    }
    Ok(out)
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn executor() -> SqliteExecutor {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor
            .run_script("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, w REAL);")
            .await
            .unwrap();
        executor
    }

    #[tokio::test]
    async fn rows_come_back_by_column_name() {
        let executor = executor().await;
        assert_eq!(executor.execute("INSERT INTO t (name, w) VALUES ('a', 1.5)").await.unwrap(), 1);
        let rows = executor.query("SELECT id, name, w FROM t").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));
        assert_eq!(rows[0].get("name"), Some(&Value::from("a")));
        assert_eq!(rows[0].get("w"), Some(&Value::Float(1.5)));
    }

    #[tokio::test]
    async fn batch_is_atomic() {
        let executor = executor().await;
        let err = executor
            .execute_batch(&[
                "INSERT INTO t (name) VALUES ('a')".to_string(),
                "INSERT INTO missing (name) VALUES ('b')".to_string(),
            ])
            .await;
        assert!(err.is_err());
        assert!(executor.query("SELECT id FROM t").await.unwrap().is_empty());

        let results = executor
            .execute_batch(&["INSERT INTO t (name) VALUES ('a') RETURNING id".to_string()])
            .await
            .unwrap();
        assert_eq!(results[0][0].get("id"), Some(&Value::Int(1)));
    }

    const ENDLESS: &str = "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) \
                           SELECT count(*) AS c FROM n";

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interrupt_stops_the_running_statement() {
        let executor = executor().await;
        let running = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.query(ENDLESS).await })
        };
        while !running.is_finished() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            assert!(executor.interrupt());
        }
        let err = running.await.unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("interrupt"), "{err:#}");

        // The connection stays usable afterwards.
        assert_eq!(executor.execute("INSERT INTO t (name) VALUES ('a')").await.unwrap(), 1);
    }
}
