//! SQL gateway: the one place table names are assembled from the configured
//! prefix, and the one place a Postgres unique-violation is recognized.
//!
//! Statement execution itself is left to `sqlx::query`/`query_as` calls in
//! the repository modules — `sqlx::Transaction`'s `Drop` impl already
//! guarantees every prepared statement and result set is released on every
//! exit path, including panics unwinding through a `?`, so there is no
//! separate "resource scoping" layer to hand-roll on top of it.

use sqlx::PgPool;

/// Postgres SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct Gateway {
    pool: PgPool,
    table_prefix: String,
}

impl Gateway {
    pub fn new(pool: PgPool, table_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Render `TRIGGERS` style bare table names into `{prefix}TRIGGERS`.
    pub fn table(&self, bare_name: &str) -> String {
        prefixed_table_name(&self.table_prefix, bare_name)
    }
}

fn prefixed_table_name(prefix: &str, bare_name: &str) -> String {
    format!("{prefix}{bare_name}")
}

/// True when `err` is a Postgres unique-constraint violation — the signal a
/// repository insert uses to turn a database error into
/// `StoreError::*AlreadyExists`.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}
