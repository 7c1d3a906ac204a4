//! Host-facing behaviour of the engine worker: request/response round trips,
//! diagnostics, lifecycle, and persistence of the sync tables on disk.

use serde_json::json;
use tether_engine::{spawn, EngineOptions, SqlParam};
use tether_testkit::{stamp, todo_schema};

fn memory_options() -> EngineOptions {
    let mut opts = EngineOptions::memory();
    opts.schema_sql = todo_schema();
    opts
}

#[tokio::test]
async fn exec_round_trips_rows_through_the_worker() -> anyhow::Result<()> {
    let engine = spawn(memory_options()).await?;

    engine
        .exec(
            "INSERT INTO todos (id, title, completed, updated_at) VALUES ($1, $2, $3, $4)",
            vec![
                SqlParam::Int(1),
                "hello".into(),
                SqlParam::Bool(false),
                stamp(0).into(),
            ],
        )
        .await?;

    let rows = engine.exec("SELECT * FROM todos", vec![]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("title"), Some(&json!("hello")));

    engine.close().await?;
    Ok(())
}

#[tokio::test]
async fn requests_after_close_fail_cleanly() -> anyhow::Result<()> {
    let engine = spawn(memory_options()).await?;
    engine.close().await?;

    let err = engine.exec("SELECT 1", vec![]).await.unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("closed") || msg.contains("dropped"), "{msg}");
    Ok(())
}

#[tokio::test]
async fn sync_without_a_remote_is_an_error() -> anyhow::Result<()> {
    let engine = spawn(memory_options()).await?;
    let err = engine.sync().await.unwrap_err();
    assert!(format!("{err:#}").contains("not configured"));
    engine.close().await?;
    Ok(())
}

#[tokio::test]
async fn diagnostics_reflect_a_sync_less_engine() -> anyhow::Result<()> {
    let engine = spawn(memory_options()).await?;
    let diag = engine.diagnostic().await?;

    assert_eq!(diag.main_database.r#type, "memory");
    assert!(!diag.sync_database.has_sync_pool);
    assert!(diag.sync_state.is_none());
    assert!(diag.outbox.error.is_some());
    assert!(diag.echo_prevention.is_none());

    engine.close().await?;
    Ok(())
}

#[tokio::test]
async fn sync_sequences_reports_zero_when_nothing_moves() -> anyhow::Result<()> {
    let mut opts = memory_options();
    opts.schema_sql.push(
        "CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT, updated_at TEXT)"
            .to_string(),
    );
    let engine = spawn(opts).await?;
    assert_eq!(engine.sync_sequences().await?, 0);
    engine.close().await?;
    Ok(())
}

#[tokio::test]
async fn file_engine_persists_across_restarts() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let url = format!("file://{}/data/app.db", dir.path().display());

    let mut opts = EngineOptions::with_url(&url);
    opts.schema_sql = todo_schema();
    let engine = spawn(opts).await?;
    engine
        .exec(
            "INSERT INTO todos (id, title, completed, updated_at) VALUES (1, 'persisted', FALSE, $1)",
            vec![stamp(0).into()],
        )
        .await?;
    engine.close().await?;

    let mut opts = EngineOptions::with_url(&url);
    opts.schema_sql = todo_schema();
    let engine = spawn(opts).await?;
    let rows = engine.exec("SELECT title FROM todos", vec![]).await?;
    assert_eq!(rows[0].get("title"), Some(&json!("persisted")));
    let diag = engine.diagnostic().await?;
    assert_eq!(diag.main_database.r#type, "file");
    engine.close().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_urls_fail_at_init() {
    let opts = EngineOptions::with_url("mysql://nope/db");
    assert!(spawn(opts).await.is_err());

    let mut opts = EngineOptions::memory();
    opts.sync_url = Some("file:///tmp/not-remote.db".to_string());
    assert!(spawn(opts).await.is_err(), "sync URL must be remote");
}
