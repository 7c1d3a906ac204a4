//! Remote schema mirror.
//!
//! Forward direction: replay user DDL on the remote so pushed rows have a
//! home. Reverse direction: when the stream delivers a change for a table
//! the embedded engine has never heard of, rebuild it locally from the
//! remote catalog.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tether_db::{quote_ident, LocalDb, RemoteDb, SqlParam};
use tracing::{info, warn};

use crate::bootstrap;
use crate::meta::MetaCache;

/// Replay user DDL on the remote inside one transaction. Individual
/// statement failures are logged and tolerated (savepoints keep the
/// transaction healthy), so the batch commits whatever succeeded.
pub async fn mirror_ddl(remote: &RemoteDb, statements: &[String]) -> Result<()> {
    if statements.is_empty() {
        return Ok(());
    }
    let mut tx = remote
        .pool()
        .begin()
        .await
        .context("begin DDL mirror transaction")?;

    for stmt in statements {
        let trimmed = stmt.trim().trim_end_matches(';');
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query("SAVEPOINT mirror_stmt")
            .execute(&mut *tx)
            .await
            .context("open DDL savepoint")?;
        match sqlx::query(trimmed).execute(&mut *tx).await {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT mirror_stmt")
                    .execute(&mut *tx)
                    .await
                    .context("release DDL savepoint")?;
            }
            Err(e) => {
                warn!("remote DDL statement failed (continuing): {e}");
                sqlx::query("ROLLBACK TO SAVEPOINT mirror_stmt")
                    .execute(&mut *tx)
                    .await
                    .context("roll back DDL savepoint")?;
            }
        }
    }
    tx.commit().await.context("commit DDL mirror transaction")?;
    Ok(())
}

/// One column of a remote table description.
#[derive(Debug, Clone)]
pub struct RemoteColumn {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub default_expr: Option<String>,
    pub identity: bool,
    pub is_pk: bool,
}

impl RemoteColumn {
    /// Backed by a sequence (serial/identity), the trigger for local
    /// auto-increment treatment.
    pub fn sequence_backed(&self) -> bool {
        self.identity
            || self
                .default_expr
                .as_deref()
                .map(|d| d.trim_start().starts_with("nextval("))
                .unwrap_or(false)
    }
}

/// Describe `table` from the remote catalog: columns in ordinal order with
/// not-null, default and primary-key information.
pub async fn describe_remote_table(remote: &RemoteDb, table: &str) -> Result<Vec<RemoteColumn>> {
    tether_db::ensure_safe_ident(table)?;

    let columns = remote
        .query(
            "SELECT column_name AS name, data_type, is_nullable, column_default, is_identity \
             FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[SqlParam::from(table)],
        )
        .await
        .context("describe remote table columns")?;
    if columns.is_empty() {
        bail!("remote table {table} does not exist");
    }

    let pk_rows = remote
        .query(
            "SELECT a.attname AS name \
             FROM pg_index i \
             JOIN unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord) ON true \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum \
             WHERE i.indrelid = to_regclass('public.' || quote_ident($1)) \
               AND i.indisprimary \
             ORDER BY k.ord",
            &[SqlParam::from(table)],
        )
        .await
        .context("describe remote table primary key")?;
    let pk_cols: Vec<&str> = pk_rows
        .iter()
        .filter_map(|r| r.get("name").and_then(Value::as_str))
        .collect();

    Ok(columns
        .iter()
        .map(|row| {
            let name = row
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            RemoteColumn {
                is_pk: pk_cols.contains(&name.as_str()),
                data_type: row
                    .get("data_type")
                    .and_then(Value::as_str)
                    .unwrap_or("text")
                    .to_string(),
                not_null: row.get("is_nullable").and_then(Value::as_str) == Some("NO"),
                default_expr: row
                    .get("column_default")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                identity: row.get("is_identity").and_then(Value::as_str) == Some("YES"),
                name,
            }
        })
        .collect())
}

/// SQLite column affinity for a Postgres `data_type`.
pub fn sqlite_type_for(pg_type: &str) -> &'static str {
    match pg_type {
        "smallint" | "integer" | "bigint" | "boolean" => "INTEGER",
        "real" | "double precision" => "REAL",
        "numeric" => "NUMERIC",
        "bytea" => "BLOB",
        // text, varchar, uuid, timestamps, json(b), everything else: text is
        // the only faithful carrier.
        _ => "TEXT",
    }
}

/// Build the local `CREATE TABLE IF NOT EXISTS` for a remote description.
pub fn build_create_table(table: &str, columns: &[RemoteColumn]) -> Result<String> {
    let qtable = quote_ident(table)?;
    let pk_cols: Vec<&RemoteColumn> = columns.iter().filter(|c| c.is_pk).collect();

    // A lone sequence-backed integer key becomes the rowid alias so local
    // inserts keep allocating past seeded rows.
    let rowid_pk = pk_cols.len() == 1
        && pk_cols[0].sequence_backed()
        && matches!(pk_cols[0].data_type.as_str(), "smallint" | "integer" | "bigint");

    let mut defs = Vec::with_capacity(columns.len() + 1);
    for col in columns {
        let qname = quote_ident(&col.name)?;
        let ty = sqlite_type_for(&col.data_type);
        if rowid_pk && col.is_pk {
            defs.push(format!("{qname} INTEGER PRIMARY KEY AUTOINCREMENT"));
            continue;
        }
        let mut def = format!("{qname} {ty}");
        if col.not_null {
            def.push_str(" NOT NULL");
        }
        defs.push(def);
    }
    if !rowid_pk && !pk_cols.is_empty() {
        let list = pk_cols
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        defs.push(format!("PRIMARY KEY ({list})"));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {qtable} (\n  {}\n)",
        defs.join(",\n  ")
    ))
}

/// Create `table` locally from its remote description, attach capture
/// triggers, and invalidate its metadata entry. Success when the table
/// already exists.
pub async fn create_table_from_remote(
    local: &LocalDb,
    remote: &RemoteDb,
    meta: &MetaCache,
    table: &str,
) -> Result<()> {
    let columns = describe_remote_table(remote, table).await?;
    let create = build_create_table(table, &columns)?;
    if let Err(e) = local.exec_batch(&create).await {
        let msg = format!("{e:#}");
        if !msg.contains("already exists") {
            return Err(e).with_context(|| format!("create local table {table}"));
        }
    }
    bootstrap::install_capture_triggers(local, table).await?;
    meta.invalidate(table);
    info!("mirrored remote table {table} locally");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, ty: &str, pk: bool, default: Option<&str>) -> RemoteColumn {
        RemoteColumn {
            name: name.to_string(),
            data_type: ty.to_string(),
            not_null: pk,
            default_expr: default.map(str::to_string),
            identity: false,
            is_pk: pk,
        }
    }

    #[test]
    fn serial_pk_becomes_rowid_alias() {
        let cols = vec![
            col("id", "integer", true, Some("nextval('todos_id_seq'::regclass)")),
            col("title", "text", false, None),
            col("completed", "boolean", false, None),
            col("updated_at", "timestamp with time zone", false, None),
        ];
        let sql = build_create_table("todos", &cols).unwrap();
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"completed\" INTEGER"));
        assert!(sql.contains("\"updated_at\" TEXT"));
        assert!(!sql.contains("PRIMARY KEY ("), "no table-level PK for rowid alias");
    }

    #[test]
    fn composite_keys_use_a_table_constraint() {
        let cols = vec![
            col("org", "text", true, None),
            col("member", "text", true, None),
            col("role", "text", false, None),
        ];
        let sql = build_create_table("memberships", &cols).unwrap();
        assert!(sql.contains("PRIMARY KEY (\"org\", \"member\")"));
        assert!(sql.contains("\"org\" TEXT NOT NULL"));
    }

    #[test]
    fn plain_integer_pk_is_not_autoincrement() {
        let cols = vec![col("id", "integer", true, None), col("v", "text", false, None)];
        let sql = build_create_table("plain", &cols).unwrap();
        assert!(!sql.contains("AUTOINCREMENT"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));
    }

    #[test]
    fn type_map_covers_the_common_catalog_types() {
        assert_eq!(sqlite_type_for("bigint"), "INTEGER");
        assert_eq!(sqlite_type_for("boolean"), "INTEGER");
        assert_eq!(sqlite_type_for("double precision"), "REAL");
        assert_eq!(sqlite_type_for("numeric"), "NUMERIC");
        assert_eq!(sqlite_type_for("character varying"), "TEXT");
        assert_eq!(sqlite_type_for("jsonb"), "TEXT");
        assert_eq!(sqlite_type_for("bytea"), "BLOB");
    }
}
