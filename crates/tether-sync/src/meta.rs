//! Per-table column metadata, lazily read from the local catalog.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tether_db::{ensure_safe_ident, LocalDb, SqlParam};

/// Frozen column lists for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    /// Primary-key columns, in key order.
    pub pk_cols: Vec<String>,
    /// Remaining columns, in catalog order.
    pub non_pk_cols: Vec<String>,
}

impl TableMeta {
    pub fn all_cols(&self) -> Vec<String> {
        let mut v = self.pk_cols.clone();
        v.extend(self.non_pk_cols.iter().cloned());
        v
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.pk_cols.iter().any(|c| c == name) || self.non_pk_cols.iter().any(|c| c == name)
    }

    fn fallback() -> Self {
        Self {
            pk_cols: vec!["id".to_string()],
            non_pk_cols: Vec::new(),
        }
    }
}

/// Read `(pk, all-columns)` for a table straight from the catalog, bypassing
/// the cache. Returns `None` when the table does not exist.
pub async fn table_columns(local: &LocalDb, table: &str) -> Result<Option<TableMeta>> {
    ensure_safe_ident(table)?;
    let rows = local
        .query(
            "SELECT name, pk FROM pragma_table_info(?1) ORDER BY cid",
            vec![SqlParam::from(table)],
        )
        .await
        .with_context(|| format!("read catalog for table {table}"))?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut keyed: Vec<(i64, String)> = Vec::new();
    let mut non_pk_cols = Vec::new();
    for row in &rows {
        let name = row
            .get("name")
            .and_then(|v| v.as_str())
            .context("catalog row without column name")?
            .to_string();
        let pk = row.get("pk").and_then(|v| v.as_i64()).unwrap_or(0);
        if pk > 0 {
            keyed.push((pk, name));
        } else {
            non_pk_cols.push(name);
        }
    }
    keyed.sort_by_key(|(pos, _)| *pos);
    Ok(Some(TableMeta {
        pk_cols: keyed.into_iter().map(|(_, name)| name).collect(),
        non_pk_cols,
    }))
}

/// Lazily populated cache of per-table column lists.
///
/// An absent table caches the `{pk: [id], non: []}` fallback so boot-time
/// code can proceed; `invalidate` drops an entry when a table is (re)created
/// from a remote description.
#[derive(Default)]
pub struct MetaCache {
    inner: Mutex<HashMap<String, Arc<TableMeta>>>,
}

impl MetaCache {
    /// Cached metadata for `table`, reading the catalog on miss.
    pub async fn ensure(&self, local: &LocalDb, table: &str) -> Result<Arc<TableMeta>> {
        if let Some(found) = self.inner.lock().expect("meta lock").get(table) {
            return Ok(Arc::clone(found));
        }
        let meta = Arc::new(
            table_columns(local, table)
                .await?
                .unwrap_or_else(TableMeta::fallback),
        );
        self.inner
            .lock()
            .expect("meta lock")
            .insert(table.to_string(), Arc::clone(&meta));
        Ok(meta)
    }

    /// Catalog truth without the fallback; does not populate the cache for
    /// absent tables.
    pub async fn lookup_existing(
        &self,
        local: &LocalDb,
        table: &str,
    ) -> Result<Option<Arc<TableMeta>>> {
        if let Some(found) = self.inner.lock().expect("meta lock").get(table) {
            return Ok(Some(Arc::clone(found)));
        }
        match table_columns(local, table).await? {
            Some(meta) => {
                let meta = Arc::new(meta);
                self.inner
                    .lock()
                    .expect("meta lock")
                    .insert(table.to_string(), Arc::clone(&meta));
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    pub fn invalidate(&self, table: &str) {
        self.inner.lock().expect("meta lock").remove(table);
    }

    pub fn tracked_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .expect("meta lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
