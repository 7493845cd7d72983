//! PostgreSQL executor built on sqlx
//!
//! Statements are logged through `tracing`: one `statement` span per call at
//! `debug`, and a `warn` event when a statement exceeds the slow-query
//! threshold. [`PgPool::with_span`] sets the parent span explicitly; otherwise
//! the caller's current span is used.

use super::{
    closed_transaction, nested_begin, ConnectionPool, IsolationLevel, Row, Transaction,
    TransactionalPool,
};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::value::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow, PgTypeInfo, PgTypeKind};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{Instrument, Span};
use uuid::Uuid;

const DEFAULT_SLOW_QUERY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct StatementLog {
    parent: Option<Span>,
    slow_query: Duration,
}

impl StatementLog {
    fn span(&self, sql: &str, params: usize) -> Span {
        let parent = self.parent.clone().unwrap_or_else(Span::current);
        tracing::debug_span!(parent: &parent, "statement", sql = %sql, params)
    }

    fn record<T>(&self, sql: &str, started: Instant, result: &std::result::Result<T, sqlx::Error>) {
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        match result {
            Err(err) => tracing::debug!(elapsed_ms, error = %err, "statement failed"),
            Ok(_) if elapsed > self.slow_query => {
                tracing::warn!(elapsed_ms, threshold_ms = self.slow_query.as_millis() as u64, %sql, "slow statement")
            }
            Ok(_) => tracing::debug!(elapsed_ms, "statement finished"),
        }
    }
}

async fn execute_on<'c, E>(executor: E, sql: &str, params: &[Value], log: &StatementLog) -> Result<u64>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let span = log.span(sql, params.len());
    let started = Instant::now();
    let result = bind_values(sqlx::query(sql), params)
        .execute(executor)
        .instrument(span.clone())
        .await;
    span.in_scope(|| log.record(sql, started, &result));
    Ok(result?.rows_affected())
}

async fn fetch_on<'c, E>(executor: E, sql: &str, params: &[Value], log: &StatementLog) -> Result<Vec<Row>>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let span = log.span(sql, params.len());
    let started = Instant::now();
    let result = bind_values(sqlx::query(sql), params)
        .fetch_all(executor)
        .instrument(span.clone())
        .await;
    span.in_scope(|| log.record(sql, started, &result));
    result?.iter().map(row_to_json).collect()
}

/// PostgreSQL connection pool wrapper
#[derive(Debug, Clone)]
pub struct PgPool {
    inner: sqlx::PgPool,
    log: StatementLog,
}

impl PgPool {
    /// Connect using the pool settings in `config`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .connect(&config.url)
            .await?;
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "database pool connected"
        );
        Ok(Self::from_pool(pool).with_slow_query_threshold(config.slow_query_threshold()))
    }

    /// Create from an existing sqlx pool
    pub fn from_pool(pool: sqlx::PgPool) -> Self {
        Self {
            inner: pool,
            log: StatementLog {
                parent: None,
                slow_query: DEFAULT_SLOW_QUERY,
            },
        }
    }

    /// Parent every statement span (including those of transactions begun here) under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.log.parent = Some(span);
        self
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.log.slow_query = threshold;
        self
    }

    pub fn inner(&self) -> &sqlx::PgPool {
        &self.inner
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl ConnectionPool for PgPool {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        execute_on(&self.inner, sql, params, &self.log).await
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        fetch_on(&self.inner, sql, params, &self.log).await
    }
}

impl TransactionalPool for PgPool {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction> {
        let tx = self.inner.begin().await?;
        self.log.span("BEGIN", 0).in_scope(|| tracing::debug!("transaction opened"));
        Ok(PgTransaction {
            inner: Arc::new(Mutex::new(Some(tx))),
            log: self.log.clone(),
        })
    }

    async fn begin_with_isolation(&self, isolation: IsolationLevel) -> Result<PgTransaction> {
        let tx = self.begin().await?;
        tx.execute(&isolation.statement(), &[]).await?;
        Ok(tx)
    }
}

/// A transaction pinned to one pooled connection
///
/// Clones share the connection. Dropping every clone without closing rolls the
/// transaction back.
#[derive(Clone)]
pub struct PgTransaction {
    inner: Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>,
    log: StatementLog,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction").finish_non_exhaustive()
    }
}

impl ConnectionPool for PgTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(closed_transaction)?;
        execute_on(&mut **tx, sql, params, &self.log).await
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(closed_transaction)?;
        fetch_on(&mut **tx, sql, params, &self.log).await
    }
}

impl Transaction for PgTransaction {
    async fn commit(&self) -> Result<()> {
        let tx = self.inner.lock().await.take().ok_or_else(closed_transaction)?;
        let started = Instant::now();
        let result = tx.commit().await;
        self.log.span("COMMIT", 0).in_scope(|| self.log.record("COMMIT", started, &result));
        Ok(result?)
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self.inner.lock().await.take().ok_or_else(closed_transaction)?;
        let started = Instant::now();
        let result = tx.rollback().await;
        self.log.span("ROLLBACK", 0).in_scope(|| self.log.record("ROLLBACK", started, &result));
        Ok(result?)
    }
}

impl TransactionalPool for PgTransaction {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction> {
        Err(nested_begin())
    }

    async fn begin_with_isolation(&self, _isolation: IsolationLevel) -> Result<PgTransaction> {
        Err(nested_begin())
    }
}

/// Bind values to a sqlx query in placeholder order
fn bind_values<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            // the renderer writes NULL inline; one passed here directly is typed text
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::I32(i) => query.bind(*i),
            Value::I64(i) => query.bind(*i),
            Value::F32(f) => query.bind(*f),
            Value::F64(f) => query.bind(*f),
            Value::String(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Json(j) => query.bind(sqlx::types::Json(j)),
            // arrays are expanded by the renderer; one left here is a nested list
            Value::Array(_) => query.bind(sqlx::types::Json(param.to_json())),
            Value::Uuid(u) => query.bind(*u),
            Value::Timestamp(ts) => query.bind(*ts),
            Value::Decimal(d) => query.bind(*d),
        };
    }
    query
}

fn row_to_json(row: &PgRow) -> Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.name(), column.type_info())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Types whose binary form is their UTF-8 text
fn is_text_like(info: &PgTypeInfo) -> bool {
    match info.kind() {
        PgTypeKind::Enum(_) => true,
        PgTypeKind::Domain(base) => is_text_like(base),
        _ => matches!(
            info.name().to_ascii_uppercase().as_str(),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "\"CHAR\"" | "CITEXT" | "UNKNOWN"
        ),
    }
}

fn decode_column(
    row: &PgRow,
    index: usize,
    name: &str,
    info: &PgTypeInfo,
) -> Result<serde_json::Value> {
    use serde_json::Value as Json;

    fn strings<T: ToString>(items: Vec<T>) -> Json {
        Json::Array(items.iter().map(|item| Json::String(item.to_string())).collect())
    }

    let value = match info.name() {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Json::from),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(Json::from),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(Json::from),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Json::from),
        "OID" => row.try_get::<Option<Oid>, _>(index)?.map(|oid| Json::from(oid.0)),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|f| Value::F32(f).to_json()),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)?
            .map(|f| Value::F64(f).to_json()),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(index)?
            .map(|d| Json::String(d.to_string())),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(index)?
            .map(|u| Json::String(u.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|ts| Json::String(ts.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(serde_json::to_value)
            .transpose()?,
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(serde_json::to_value)
            .transpose()?,
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)?
            .map(serde_json::to_value)
            .transpose()?,
        "INTERVAL" => row.try_get::<Option<PgInterval>, _>(index)?.map(|i| {
            serde_json::json!({
                "months": i.months,
                "days": i.days,
                "microseconds": i.microseconds,
            })
        }),
        "JSON" | "JSONB" => row.try_get::<Option<Json>, _>(index)?,
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index)?.map(Json::from),
        "VOID" => None,
        "TEXT[]" | "VARCHAR[]" | "NAME[]" | "CHAR[]" => {
            row.try_get::<Option<Vec<String>>, _>(index)?.map(Json::from)
        }
        "BOOL[]" => row.try_get::<Option<Vec<bool>>, _>(index)?.map(Json::from),
        "INT2[]" => row.try_get::<Option<Vec<i16>>, _>(index)?.map(Json::from),
        "INT4[]" => row.try_get::<Option<Vec<i32>>, _>(index)?.map(Json::from),
        "INT8[]" => row.try_get::<Option<Vec<i64>>, _>(index)?.map(Json::from),
        "FLOAT4[]" => row.try_get::<Option<Vec<f32>>, _>(index)?.map(|items| {
            Json::Array(items.into_iter().map(|f| Value::F32(f).to_json()).collect())
        }),
        "FLOAT8[]" => row.try_get::<Option<Vec<f64>>, _>(index)?.map(|items| {
            Json::Array(items.into_iter().map(|f| Value::F64(f).to_json()).collect())
        }),
        "NUMERIC[]" => row.try_get::<Option<Vec<Decimal>>, _>(index)?.map(strings),
        "UUID[]" => row.try_get::<Option<Vec<Uuid>>, _>(index)?.map(strings),
        _ if is_text_like(info) => {
            row.try_get_unchecked::<Option<String>, _>(index)?.map(Json::String)
        }
        other => {
            return Err(Error::not_valid(format!(
                "column `{name}` has unsupported type {other}; cast it to a supported type such as text"
            )))
        }
    };
    Ok(value.unwrap_or(Json::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_binding_accepts_every_value() {
        let params = vec![
            Value::Null,
            Value::Bool(true),
            Value::I64(7),
            Value::F64(2.5),
            Value::String("ada".into()),
            Value::Bytes(vec![1, 2]),
            Value::Json(serde_json::json!({"k": "v"})),
            Value::Array(vec![Value::Array(vec![Value::I32(1)])]),
            Value::Uuid(Uuid::nil()),
            Value::Timestamp(Utc.timestamp_opt(0, 0).unwrap()),
            Value::Decimal(Decimal::new(5, 1)),
        ];
        let sql = "SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11";
        let _bound = bind_values(sqlx::query(sql), &params);
    }

    #[test]
    fn test_statement_log_threshold() {
        let log = StatementLog {
            parent: Some(Span::none()),
            slow_query: Duration::from_millis(250),
        };
        let ok: std::result::Result<(), sqlx::Error> = Ok(());
        log.record("SELECT 1", Instant::now(), &ok);
        log.record("SELECT 1", Instant::now(), &Err::<(), _>(sqlx::Error::RowNotFound));
        assert_eq!(log.slow_query, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_lazy_pool_builders() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/quarry_test")
            .unwrap();
        let pool = PgPool::from_pool(pool)
            .with_span(tracing::info_span!("request", id = 7))
            .with_slow_query_threshold(Duration::from_secs(1));
        assert_eq!(pool.log.slow_query, Duration::from_secs(1));
        assert!(pool.log.parent.is_some());
    }
}
