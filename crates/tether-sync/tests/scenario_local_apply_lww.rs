//! The puller's local apply path: LWW-guarded upserts, deletes, the closed
//! echo loop (applies never re-enter the outbox), and primary-key updates.

use serde_json::json;
use tether_db::{Row, SqlParam};
use tether_sync::meta::MetaCache;
use tether_sync::pull::apply_local_change;
use tether_sync::{bootstrap, outbox, ChangeOp};
use tether_testkit::{memory_db, stamp, todo_schema};

fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn inbound_change_applies_and_stays_out_of_the_outbox() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &todo_schema(), true).await?;
    let meta = MetaCache::default().ensure(&db, "todos").await?;

    let inbound = row(&[
        ("id", json!(1)),
        ("title", json!("from remote")),
        ("completed", json!(true)),
        ("updated_at", json!(stamp(10))),
    ]);
    apply_local_change(&db, &meta, "todos", ChangeOp::Insert, None, &inbound, "updated_at").await?;

    let rows = db.query("SELECT * FROM todos", vec![]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("title"), Some(&json!("from remote")));
    assert_eq!(rows[0].get("completed"), Some(&json!(1)));

    assert_eq!(
        outbox::total_count(&db).await?,
        0,
        "remote applies must not produce outbox entries"
    );
    Ok(())
}

#[tokio::test]
async fn stale_remote_change_loses_under_lww() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &todo_schema(), true).await?;
    let meta = MetaCache::default().ensure(&db, "todos").await?;

    // Local row at T3.
    db.exec(
        "INSERT INTO todos (id, title, completed, updated_at) VALUES (1, 'local truth', FALSE, ?1)",
        vec![SqlParam::Text(stamp(30))],
    )
    .await?;

    // Remote event carries T2 < T3: the apply attempt must change nothing.
    let stale = row(&[
        ("id", json!(1)),
        ("title", json!("stale remote")),
        ("completed", json!(true)),
        ("updated_at", json!(stamp(20))),
    ]);
    apply_local_change(&db, &meta, "todos", ChangeOp::Update, None, &stale, "updated_at").await?;

    let rows = db.query("SELECT * FROM todos WHERE id = 1", vec![]).await?;
    assert_eq!(rows[0].get("title"), Some(&json!("local truth")));
    assert_eq!(rows[0].get("updated_at"), Some(&json!(stamp(30))));

    // A genuinely newer event wins.
    let fresh = row(&[
        ("id", json!(1)),
        ("title", json!("newer remote")),
        ("completed", json!(true)),
        ("updated_at", json!(stamp(40))),
    ]);
    apply_local_change(&db, &meta, "todos", ChangeOp::Update, None, &fresh, "updated_at").await?;
    let rows = db.query("SELECT * FROM todos WHERE id = 1", vec![]).await?;
    assert_eq!(rows[0].get("title"), Some(&json!("newer remote")));
    Ok(())
}

#[tokio::test]
async fn inbound_delete_removes_by_pk() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &todo_schema(), true).await?;
    let meta = MetaCache::default().ensure(&db, "todos").await?;

    db.exec(
        "INSERT INTO todos (id, title, completed, updated_at) VALUES (1, 'A', FALSE, ?1), (2, 'B', FALSE, ?1)",
        vec![SqlParam::Text(stamp(0))],
    )
    .await?;

    let key = row(&[("id", json!(1))]);
    apply_local_change(&db, &meta, "todos", ChangeOp::Delete, None, &key, "updated_at").await?;

    let rows = db.query("SELECT id FROM todos ORDER BY id", vec![]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&json!(2)));
    assert_eq!(outbox::total_count(&db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn pk_update_replaces_the_old_row() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &todo_schema(), true).await?;
    let meta = MetaCache::default().ensure(&db, "todos").await?;

    db.exec(
        "INSERT INTO todos (id, title, completed, updated_at) VALUES (1, 'renumber me', FALSE, ?1)",
        vec![SqlParam::Text(stamp(0))],
    )
    .await?;

    let old_key = row(&[("id", json!(1))]);
    let new_image = row(&[
        ("id", json!(9)),
        ("title", json!("renumber me")),
        ("completed", json!(false)),
        ("updated_at", json!(stamp(1))),
    ]);
    apply_local_change(
        &db,
        &meta,
        "todos",
        ChangeOp::Update,
        Some(&old_key),
        &new_image,
        "updated_at",
    )
    .await?;

    let rows = db.query("SELECT id FROM todos ORDER BY id", vec![]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&json!(9)));
    Ok(())
}

#[tokio::test]
async fn extra_remote_columns_are_dropped() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &todo_schema(), true).await?;
    let meta = MetaCache::default().ensure(&db, "todos").await?;

    let inbound = row(&[
        ("id", json!(1)),
        ("title", json!("trimmed")),
        ("completed", json!(false)),
        ("updated_at", json!(stamp(0))),
        ("remote_only_column", json!("ignored")),
    ]);
    apply_local_change(&db, &meta, "todos", ChangeOp::Insert, None, &inbound, "updated_at").await?;

    let rows = db.query("SELECT * FROM todos", vec![]).await?;
    assert_eq!(rows[0].get("title"), Some(&json!("trimmed")));
    assert!(!rows[0].contains_key("remote_only_column"));
    Ok(())
}

#[tokio::test]
async fn apply_failure_rolls_back_and_rearms_capture() -> anyhow::Result<()> {
    let db = memory_db()?;
    bootstrap::apply_schema(&db, &todo_schema(), true).await?;
    let meta = MetaCache::default().ensure(&db, "todos").await?;

    // NOT NULL title violation aborts the apply transaction.
    let bad = row(&[
        ("id", json!(1)),
        ("title", json!(null)),
        ("completed", json!(false)),
        ("updated_at", json!(stamp(0))),
    ]);
    let result =
        apply_local_change(&db, &meta, "todos", ChangeOp::Insert, None, &bad, "updated_at").await;
    assert!(result.is_err());

    // The flag update rolled back with the rest of the transaction, so local
    // writes are captured again.
    db.exec(
        "INSERT INTO todos (id, title, completed, updated_at) VALUES (2, 'ok', FALSE, ?1)",
        vec![SqlParam::Text(stamp(1))],
    )
    .await?;
    assert_eq!(outbox::total_count(&db).await?, 1);
    Ok(())
}
