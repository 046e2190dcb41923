//! Postgres-backed collaborators.
//!
//! ## Log table
//!
//! `PostgresLogStore` writes into a table shaped like:
//!
//! ```text
//! app_logs (level text, message text, exception text NULL, logged_at timestamptz)
//! ```
//!
//! A batch is inserted with one `INSERT ... SELECT FROM UNNEST(...)` statement, so it is
//! persisted atomically: either every entry lands or none does.
//!
//! ## Computations
//!
//! `PostgresComputationRunner` executes `CALL <name>($1::jsonb)`, passing the arguments
//! as one JSON object. The procedure name is interpolated into the statement, so it is
//! checked against a strict identifier grammar first.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | PoolClosed, PoolTimedOut, Io, Tls | `Unavailable` |
//! | Database (any code) | `Rejected` |
//! | Other | `Rejected` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::instrument;

use cityscore_core::StoreError;
use cityscore_queue::LogEntry;

use super::{ComputationArgs, ComputationRunner, LogStore};

const DEFAULT_LOG_TABLE: &str = "app_logs";

/// Open a small connection pool for the background workers.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Log store writing batches into a Postgres table.
#[derive(Debug, Clone)]
pub struct PostgresLogStore {
    pool: PgPool,
    insert_sql: String,
}

impl PostgresLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            insert_sql: insert_statement(DEFAULT_LOG_TABLE),
        }
    }

    /// Write into `table` instead of `app_logs`.
    pub fn with_table(mut self, table: &str) -> Result<Self, StoreError> {
        validate_identifier(table)?;
        self.insert_sql = insert_statement(table);
        Ok(self)
    }
}

fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (level, message, exception, logged_at) \
         SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::timestamptz[])"
    )
}

#[async_trait]
impl LogStore for PostgresLogStore {
    #[instrument(skip(self, entries), fields(batch_len = entries.len()), err)]
    async fn persist_batch(&self, entries: &[LogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut levels = Vec::with_capacity(entries.len());
        let mut messages = Vec::with_capacity(entries.len());
        let mut exceptions: Vec<Option<String>> = Vec::with_capacity(entries.len());
        let mut timestamps: Vec<DateTime<Utc>> = Vec::with_capacity(entries.len());
        for entry in entries {
            levels.push(entry.level().as_str().to_string());
            messages.push(entry.message().to_string());
            exceptions.push(entry.exception().map(str::to_string));
            timestamps.push(entry.timestamp());
        }

        sqlx::query(&self.insert_sql)
            .bind(levels)
            .bind(messages)
            .bind(exceptions)
            .bind(timestamps)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("persist_batch", e))?;

        Ok(())
    }
}

/// Computation runner calling stored procedures.
#[derive(Debug, Clone)]
pub struct PostgresComputationRunner {
    pool: PgPool,
}

impl PostgresComputationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ComputationRunner for PostgresComputationRunner {
    #[instrument(skip(self, args), err)]
    async fn run(&self, name: &str, args: ComputationArgs) -> Result<(), StoreError> {
        validate_identifier(name)?;

        let sql = format!("CALL {name}($1::jsonb)");
        sqlx::query(&sql)
            .bind(sqlx::types::Json(serde_json::Value::Object(args)))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(name, e))?;

        Ok(())
    }
}

/// Accept `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(StoreError::invalid_input(format!(
            "not a valid SQL identifier: {name:?}"
        )))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::rejected(format!(
                "database error in {operation} [{code}]: {}",
                db_err.message()
            ))
        }
        other => StoreError::rejected(format!("sqlx error in {operation}: {other}")),
    }
}
