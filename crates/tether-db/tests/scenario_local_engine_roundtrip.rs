//! Embedded back-end behaviour: JSON row shape, transactional exec,
//! insert notifications, and the fallback from an unusable file to memory.

use serde_json::json;
use tether_db::{DbLocation, LocalDb, LocalKind, LocalOptions, SqlParam};

fn memory_db() -> LocalDb {
    LocalDb::open_memory(&LocalOptions::default()).expect("open memory engine")
}

#[tokio::test]
async fn query_returns_json_rows() -> anyhow::Result<()> {
    let db = memory_db();
    db.exec_batch(
        "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT, done INTEGER, score REAL);",
    )
    .await?;
    db.exec(
        "INSERT INTO todos (id, title, done, score) VALUES (?1, ?2, ?3, ?4)",
        vec![
            SqlParam::Int(1),
            SqlParam::Text("write tests".to_string()),
            SqlParam::Bool(false),
            SqlParam::Float(0.5),
        ],
    )
    .await?;

    let rows = db.query("SELECT * FROM todos", vec![]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&json!(1)));
    assert_eq!(rows[0].get("title"), Some(&json!("write tests")));
    assert_eq!(rows[0].get("done"), Some(&json!(0)));
    assert_eq!(rows[0].get("score"), Some(&json!(0.5)));
    Ok(())
}

#[tokio::test]
async fn exec_tx_rolls_back_on_failure() -> anyhow::Result<()> {
    let db = memory_db();
    db.exec_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);").await?;

    let result = db
        .exec_tx(vec![
            ("INSERT INTO t (id) VALUES (1)".to_string(), vec![]),
            ("INSERT INTO no_such_table (id) VALUES (2)".to_string(), vec![]),
        ])
        .await;
    assert!(result.is_err());

    let rows = db.query("SELECT COUNT(*) AS n FROM t", vec![]).await?;
    assert_eq!(rows[0].get("n"), Some(&json!(0)), "transaction must roll back");
    Ok(())
}

#[tokio::test]
async fn listen_reports_inserts_into_watched_table() -> anyhow::Result<()> {
    let db = memory_db();
    db.exec_batch(
        "CREATE TABLE _outbox (id INTEGER PRIMARY KEY AUTOINCREMENT, table_name TEXT);
         CREATE TABLE other (id INTEGER PRIMARY KEY);",
    )
    .await?;

    let mut rx = db.listen("_outbox");
    db.exec("INSERT INTO other (id) VALUES (1)", vec![]).await?;
    db.exec(
        "INSERT INTO _outbox (table_name) VALUES (?1)",
        vec![SqlParam::from("todos")],
    )
    .await?;

    let note = rx.recv().await.expect("notification");
    assert_eq!(note.channel, "_outbox");
    assert_eq!(note.payload, "1", "payload is the new rowid");
    assert!(rx.try_recv().is_err(), "unwatched table must not notify");
    Ok(())
}

#[tokio::test]
async fn file_engine_creates_parents_and_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested/data/app.db");

    let db = LocalDb::open_file(&path, &LocalOptions::default())?;
    assert_eq!(db.kind(), &LocalKind::File(path.clone()));
    db.exec_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (7);")
        .await?;
    db.close().await?;

    let db = LocalDb::open_file(&path, &LocalOptions::default())?;
    let rows = db.query("SELECT id FROM t", vec![]).await?;
    assert_eq!(rows[0].get("id"), Some(&json!(7)));
    Ok(())
}

#[tokio::test]
async fn unusable_file_path_falls_back_to_memory() -> anyhow::Result<()> {
    // A directory cannot be opened as a database file.
    let dir = tempfile::tempdir()?;
    let db = LocalDb::open_file(&dir.path().to_path_buf(), &LocalOptions::default())?;
    assert_eq!(db.kind(), &LocalKind::Memory);
    db.exec_batch("CREATE TABLE t (id INTEGER);").await?;
    Ok(())
}

#[test]
fn remote_urls_parse_as_remote() {
    assert!(DbLocation::parse("postgres://user@host/db").unwrap().is_remote());
    assert!(!DbLocation::parse(":memory:").unwrap().is_remote());
}
