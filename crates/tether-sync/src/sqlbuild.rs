//! Statement builders for LWW-guarded applies.
//!
//! Both directions take exactly one parameter: the row image (or PK map) as
//! JSON. The embedded side extracts values with `json_extract`; the remote
//! side casts through the table's own row type with `jsonb_populate_record`,
//! which reuses Postgres input conversion for every column type.

use anyhow::{bail, Result};
use tether_db::quote_ident;

use crate::meta::TableMeta;

/// Columns to write: the table's columns (catalog order) restricted to keys
/// actually present in the row image. PK columns must all be present.
pub fn writable_columns(
    meta: &TableMeta,
    row: &tether_db::Row,
    table: &str,
) -> Result<Vec<String>> {
    for pk in &meta.pk_cols {
        if !row.contains_key(pk) {
            bail!("row image for {table} is missing primary-key column {pk}");
        }
    }
    Ok(meta
        .all_cols()
        .into_iter()
        .filter(|c| row.contains_key(c))
        .collect())
}

/// Embedded upsert: `INSERT … VALUES (json_extract(?1, '$.col')…) ON CONFLICT
/// (pks) DO UPDATE SET … WHERE excluded.lww > target.lww`.
pub fn local_upsert(
    table: &str,
    meta: &TableMeta,
    columns: &[String],
    lww_column: &str,
) -> Result<String> {
    let qtable = quote_ident(table)?;
    let col_list = quoted_list(columns)?;
    let values = columns
        .iter()
        .map(|c| {
            quote_ident(c)?;
            Ok(format!("json_extract(?1, '$.{c}')"))
        })
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let pk_list = quoted_list(&meta.pk_cols)?;

    let set_cols: Vec<&String> = columns
        .iter()
        .filter(|c| meta.non_pk_cols.contains(c))
        .collect();
    let conflict = if set_cols.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let sets = set_cols
            .iter()
            .map(|c| {
                let q = quote_ident(c)?;
                Ok(format!("{q} = excluded.{q}"))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let guard = if meta.has_column(lww_column) && columns.iter().any(|c| c == lww_column) {
            let q = quote_ident(lww_column)?;
            format!(" WHERE excluded.{q} > {qtable}.{q}")
        } else {
            String::new()
        };
        format!("DO UPDATE SET {sets}{guard}")
    };

    Ok(format!(
        "INSERT INTO {qtable} ({col_list}) VALUES ({values}) ON CONFLICT ({pk_list}) {conflict}"
    ))
}

/// Embedded delete by PK equality; the parameter is the PK map as JSON.
pub fn local_delete(table: &str, pk_cols: &[String]) -> Result<String> {
    let qtable = quote_ident(table)?;
    let preds = pk_cols
        .iter()
        .map(|c| {
            let q = quote_ident(c)?;
            Ok(format!("{q} = json_extract(?1, '$.{c}')"))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" AND ");
    Ok(format!("DELETE FROM {qtable} WHERE {preds}"))
}

/// Remote upsert through `jsonb_populate_record`, with the same LWW guard on
/// the conflict branch.
pub fn remote_upsert(
    table: &str,
    meta: &TableMeta,
    columns: &[String],
    lww_column: &str,
) -> Result<String> {
    let qtable = quote_ident(table)?;
    let col_list = quoted_list(columns)?;
    let select = columns
        .iter()
        .map(|c| Ok(format!("src.{}", quote_ident(c)?)))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let pk_list = quoted_list(&meta.pk_cols)?;

    let set_cols: Vec<&String> = columns
        .iter()
        .filter(|c| meta.non_pk_cols.contains(c))
        .collect();
    let conflict = if set_cols.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let sets = set_cols
            .iter()
            .map(|c| {
                let q = quote_ident(c)?;
                Ok(format!("{q} = EXCLUDED.{q}"))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let guard = if meta.has_column(lww_column) && columns.iter().any(|c| c == lww_column) {
            let q = quote_ident(lww_column)?;
            format!(" WHERE tgt.{q} < EXCLUDED.{q}")
        } else {
            String::new()
        };
        format!("DO UPDATE SET {sets}{guard}")
    };

    Ok(format!(
        "INSERT INTO {qtable} AS tgt ({col_list}) \
         SELECT {select} FROM jsonb_populate_record(NULL::{qtable}, $1::jsonb) AS src \
         ON CONFLICT ({pk_list}) {conflict}"
    ))
}

/// Remote delete by PK equality; the parameter is the PK map as JSON.
pub fn remote_delete(table: &str, pk_cols: &[String]) -> Result<String> {
    let qtable = quote_ident(table)?;
    let preds = pk_cols
        .iter()
        .map(|c| {
            let q = quote_ident(c)?;
            Ok(format!("tgt.{q} = src.{q}"))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" AND ");
    Ok(format!(
        "DELETE FROM {qtable} AS tgt \
         USING jsonb_populate_record(NULL::{qtable}, $1::jsonb) AS src WHERE {preds}"
    ))
}

fn quoted_list(cols: &[String]) -> Result<String> {
    Ok(cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo_meta() -> TableMeta {
        TableMeta {
            pk_cols: vec!["id".to_string()],
            non_pk_cols: vec![
                "title".to_string(),
                "completed".to_string(),
                "updated_at".to_string(),
            ],
        }
    }

    #[test]
    fn local_upsert_carries_lww_guard() {
        let meta = todo_meta();
        let cols = meta.all_cols();
        let sql = local_upsert("todos", &meta, &cols, "updated_at").unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"todos\" (\"id\", \"title\", \"completed\", \"updated_at\") \
             VALUES (json_extract(?1, '$.id'), json_extract(?1, '$.title'), \
             json_extract(?1, '$.completed'), json_extract(?1, '$.updated_at')) \
             ON CONFLICT (\"id\") DO UPDATE SET \"title\" = excluded.\"title\", \
             \"completed\" = excluded.\"completed\", \"updated_at\" = excluded.\"updated_at\" \
             WHERE excluded.\"updated_at\" > \"todos\".\"updated_at\""
        );
    }

    #[test]
    fn remote_upsert_goes_through_populate_record() {
        let meta = todo_meta();
        let cols = meta.all_cols();
        let sql = remote_upsert("todos", &meta, &cols, "updated_at").unwrap();
        assert!(sql.contains("jsonb_populate_record(NULL::\"todos\", $1::jsonb)"));
        assert!(sql.ends_with("WHERE tgt.\"updated_at\" < EXCLUDED.\"updated_at\""));
    }

    #[test]
    fn pk_only_tables_do_nothing_on_conflict() {
        let meta = TableMeta {
            pk_cols: vec!["a".to_string(), "b".to_string()],
            non_pk_cols: vec![],
        };
        let cols = meta.all_cols();
        let sql = local_upsert("pairs", &meta, &cols, "updated_at").unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"a\", \"b\") DO NOTHING"));
    }

    #[test]
    fn deletes_compare_every_pk_column() {
        let pks = vec!["org".to_string(), "id".to_string()];
        assert_eq!(
            local_delete("memberships", &pks).unwrap(),
            "DELETE FROM \"memberships\" WHERE \"org\" = json_extract(?1, '$.org') \
             AND \"id\" = json_extract(?1, '$.id')"
        );
        let sql = remote_delete("memberships", &pks).unwrap();
        assert!(sql.contains("tgt.\"org\" = src.\"org\" AND tgt.\"id\" = src.\"id\""));
    }

    #[test]
    fn writable_columns_requires_all_pk_columns() {
        let meta = todo_meta();
        let row: tether_db::Row = [("title".to_string(), json!("x"))].into_iter().collect();
        assert!(writable_columns(&meta, &row, "todos").is_err());

        let row: tether_db::Row = [
            ("id".to_string(), json!(1)),
            ("title".to_string(), json!("x")),
            ("extra_remote_only".to_string(), json!("dropped")),
        ]
        .into_iter()
        .collect();
        let cols = writable_columns(&meta, &row, "todos").unwrap();
        assert_eq!(cols, vec!["id".to_string(), "title".to_string()]);
    }
}
