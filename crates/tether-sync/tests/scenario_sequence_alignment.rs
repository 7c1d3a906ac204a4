//! Auto-increment counter alignment: idempotent, monotone, and effective
//! after rows are seeded with explicit ids.

use serde_json::json;
use tether_db::SqlParam;
use tether_sync::{bootstrap, sequences};
use tether_testkit::{memory_db, stamp};

fn schema() -> Vec<String> {
    vec![
        "CREATE TABLE notes (\
           id INTEGER PRIMARY KEY AUTOINCREMENT, \
           body TEXT, \
           updated_at TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE plain (id INTEGER PRIMARY KEY, v TEXT)".to_string(),
    ]
}

#[tokio::test]
async fn next_insert_allocates_past_seeded_rows() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &schema(), true).await?;

    // Seed with explicit ids, the way initial sync does.
    bootstrap::set_applying(&db, true).await?;
    db.exec(
        "INSERT INTO notes (id, body, updated_at) VALUES (41, 'a', ?1), (42, 'b', ?1)",
        vec![SqlParam::Text(stamp(0))],
    )
    .await?;
    bootstrap::set_applying(&db, false).await?;

    let synced = sequences::sync_all(&db).await?;
    assert!(synced <= 1, "only the autoincrement table is considered");

    db.exec(
        "INSERT INTO notes (body, updated_at) VALUES ('c', ?1)",
        vec![SqlParam::Text(stamp(1))],
    )
    .await?;
    let rows = db
        .query("SELECT MAX(id) AS m FROM notes", vec![])
        .await?;
    assert_eq!(rows[0].get("m"), Some(&json!(43)));
    Ok(())
}

#[tokio::test]
async fn alignment_is_idempotent_and_never_regresses() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &schema(), true).await?;

    db.exec(
        "INSERT INTO notes (id, body, updated_at) VALUES (10, 'x', ?1)",
        vec![SqlParam::Text(stamp(0))],
    )
    .await?;
    sequences::sync_all(&db).await?;
    let seq_after_first = current_seq(&db).await?;

    // Repeated runs change nothing.
    for _ in 0..3 {
        sequences::sync_all(&db).await?;
        assert_eq!(current_seq(&db).await?, seq_after_first);
    }

    // Deleting the max row must not pull the counter backwards.
    db.exec("DELETE FROM notes WHERE id = 10", vec![]).await?;
    sequences::sync_all(&db).await?;
    assert_eq!(current_seq(&db).await?, seq_after_first);
    Ok(())
}

#[tokio::test]
async fn empty_tables_are_left_alone() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &schema(), true).await?;
    assert_eq!(sequences::sync_all(&db).await?, 0);
    Ok(())
}

async fn current_seq(db: &tether_db::LocalDb) -> anyhow::Result<i64> {
    let rows = db
        .query(
            "SELECT seq FROM sqlite_sequence WHERE name = 'notes'",
            vec![],
        )
        .await?;
    Ok(rows
        .first()
        .and_then(|r| r.get("seq"))
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0))
}
