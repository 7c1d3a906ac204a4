//! The remote Postgres back-end.
//!
//! A small fixed pool. Result rows travel as JSON: `query` wraps the
//! statement in `row_to_json` so callers get the same row shape the embedded
//! back-end produces, regardless of column types.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row as _};

use crate::value::{Row, SqlParam};

const POOL_MAX_CONNECTIONS: u32 = 5;

pub struct RemoteDb {
    pool: PgPool,
}

impl RemoteDb {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .context("connect to remote database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a SELECT-shaped statement, returning rows as JSON objects.
    pub async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>> {
        let sql = sql.trim().trim_end_matches(';');
        let wrapped = format!("SELECT row_to_json(_q)::text AS _row FROM ({sql}) AS _q");
        let mut q = sqlx::query(&wrapped);
        for p in params {
            q = bind_param(q, p);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("remote query failed: {sql}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get(0).context("read remote row")?;
            let value: Value =
                serde_json::from_str(&raw).context("decode remote row as JSON")?;
            let obj = value
                .as_object()
                .cloned()
                .ok_or_else(|| anyhow!("remote row is not a JSON object"))?;
            out.push(obj);
        }
        Ok(out)
    }

    pub async fn exec(&self, sql: &str) -> Result<u64> {
        self.exec_with(sql, &[]).await
    }

    pub async fn exec_with(&self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        let mut q = sqlx::query(sql);
        for p in params {
            q = bind_param(q, p);
        }
        let done = q
            .execute(&self.pool)
            .await
            .with_context(|| format!("remote exec failed: {sql}"))?;
        Ok(done.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Bind one parameter onto a sqlx query.
pub fn bind_param<'q>(
    q: Query<'q, Postgres, PgArguments>,
    p: &SqlParam,
) -> Query<'q, Postgres, PgArguments> {
    match p {
        SqlParam::Null => q.bind(None::<String>),
        SqlParam::Bool(b) => q.bind(*b),
        SqlParam::Int(i) => q.bind(*i),
        SqlParam::Float(f) => q.bind(*f),
        SqlParam::Text(s) => q.bind(s.clone()),
        SqlParam::Json(v) => q.bind(v.clone()),
    }
}
