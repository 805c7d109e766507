//! PostgreSQL executor over a `sqlx` pool.

use anyhow::Context;
use async_trait::async_trait;
use geostore_core::{Attributes, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{BigDecimal, Uuid};
use sqlx::{Column, Row as _, TypeInfo};

use super::{Row, SqlExecutor};

#[derive(Debug, Clone)]
pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("connect to postgres")?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn query(&self, sql: &str) -> anyhow::Result<Vec<Row>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("query: {sql}"))?;
        rows.iter().map(to_row).collect()
    }

    async fn execute(&self, sql: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("execute: {sql}"))?;
        Ok(result.rows_affected())
    }

    async fn execute_batch(&self, statements: &[String]) -> anyhow::Result<Vec<Vec<Row>>> {
        let mut tx = self.pool.begin().await.context("begin postgres transaction")?;
        let mut results = Vec::with_capacity(statements.len());
        for sql in statements {
            let rows = sqlx::query(sql)
                .fetch_all(&mut *tx)
                .await
                .with_context(|| format!("execute: {sql}"))?;
            results.push(rows.iter().map(to_row).collect::<anyhow::Result<Vec<_>>>()?);
        }
        tx.commit().await.context("commit postgres transaction")?;
        Ok(results)
    }
}

/// How a column type maps onto [`Value`]. Temporal values become ISO 8601
/// text, which orders correctly under string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
}

fn column_kind(type_name: &str) -> Option<ColumnKind> {
    Some(match type_name {
        "BOOL" => ColumnKind::Bool,
        "INT2" => ColumnKind::Int2,
        "INT4" => ColumnKind::Int4,
        "INT8" => ColumnKind::Int8,
        "FLOAT4" => ColumnKind::Float4,
        "FLOAT8" => ColumnKind::Float8,
        "NUMERIC" => ColumnKind::Numeric,
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" | "UNKNOWN" => ColumnKind::Text,
        "UUID" => ColumnKind::Uuid,
        "DATE" => ColumnKind::Date,
        "TIME" => ColumnKind::Time,
        "TIMESTAMP" => ColumnKind::Timestamp,
        "TIMESTAMPTZ" => ColumnKind::TimestampTz,
        _ => return None,
    })
}

/// Fails on column types without a mapping instead of reading them as null.
fn to_row(row: &PgRow) -> anyhow::Result<Row> {
    let mut attributes = Attributes::new();
    for column in row.columns() {
        let type_name = column.type_info().name();
        let kind = column_kind(type_name)
            .with_context(|| format!("column {} has unsupported type {type_name}", column.name()))?;
        let value = decode(row, column.ordinal(), kind)
            .with_context(|| format!("decode column {} ({type_name})", column.name()))?;
        attributes.set(column.name(), value.unwrap_or(Value::Null));
    }
    Ok(attributes)
}

fn decode(row: &PgRow, i: usize, kind: ColumnKind) -> Result<Option<Value>, sqlx::Error> {
    Ok(match kind {
        ColumnKind::Bool => row.try_get::<Option<bool>, _>(i)?.map(Value::Bool),
        ColumnKind::Int2 => row.try_get::<Option<i16>, _>(i)?.map(|n| Value::Int(n.into())),
        ColumnKind::Int4 => row.try_get::<Option<i32>, _>(i)?.map(|n| Value::Int(n.into())),
        ColumnKind::Int8 => row.try_get::<Option<i64>, _>(i)?.map(Value::Int),
        ColumnKind::Float4 => row.try_get::<Option<f32>, _>(i)?.map(|n| Value::Float(n.into())),
        ColumnKind::Float8 => row.try_get::<Option<f64>, _>(i)?.map(Value::Float),
        ColumnKind::Numeric => row
            .try_get::<Option<BigDecimal>, _>(i)?
            .map(|d| decimal_value(&d.to_string())),
        ColumnKind::Text => row.try_get::<Option<String>, _>(i)?.map(Value::String),
        ColumnKind::Uuid => row.try_get::<Option<Uuid>, _>(i)?.map(|u| Value::String(u.to_string())),
        ColumnKind::Date => row.try_get::<Option<NaiveDate>, _>(i)?.map(|d| Value::String(d.to_string())),
        ColumnKind::Time => row.try_get::<Option<NaiveTime>, _>(i)?.map(|t| Value::String(t.to_string())),
        ColumnKind::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(i)?
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        ColumnKind::TimestampTz => row
            .try_get::<Option<DateTime<Utc>>, _>(i)?
            .map(|t| Value::String(t.to_rfc3339())),
    })
}

/// Integral decimals become integers when they fit, others floats.
fn decimal_value(text: &str) -> Value {
    text.parse::<i64>()
        .map(Value::Int)
        .or_else(|_| text.parse::<f64>().map(Value::Float))
        .unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_attribute_types_have_a_mapping() {
        assert_eq!(column_kind("UUID"), Some(ColumnKind::Uuid));
        assert_eq!(column_kind("NUMERIC"), Some(ColumnKind::Numeric));
        assert_eq!(column_kind("TIMESTAMPTZ"), Some(ColumnKind::TimestampTz));
        assert_eq!(column_kind("VARCHAR"), Some(ColumnKind::Text));
        assert_eq!(column_kind("JSONB"), None);
        assert_eq!(column_kind("BYTEA"), None);
    }

    #[test]
    fn decimals_keep_their_value() {
        assert_eq!(decimal_value("42"), Value::Int(42));
        assert_eq!(decimal_value("12.50"), Value::Float(12.5));
        assert_eq!(decimal_value("1E+3"), Value::Float(1000.0));
        assert!(matches!(decimal_value("123456789012345678901234567890"), Value::Float(f) if f > 1e29));
    }
}
