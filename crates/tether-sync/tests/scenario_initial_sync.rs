//! Initial catch-up against a real Postgres: schema mirroring, the LWW
//! cutoff, idempotency, and sequence alignment. Skips without
//! TETHER_TEST_DATABASE_URL.

use std::sync::Arc;

use serde_json::json;
use tether_db::{LocalDb, LocalOptions, RemoteDb};
use tether_sync::{bootstrap, initial, outbox, SyncShared};
use tether_testkit::{init_tracing, remote_url, unique_table};
use uuid::Uuid;

async fn setup() -> anyhow::Result<Option<(Arc<SyncShared>, String)>> {
    init_tracing();
    let Some(url) = remote_url() else {
        eprintln!("SKIP: {} not set", tether_testkit::ENV_DB_URL);
        return Ok(None);
    };

    let table = unique_table("archive");
    let local = LocalDb::open_memory(&LocalOptions::default())?;
    let remote = RemoteDb::connect(&url).await?;
    // Sync infrastructure only; the schema comes from the remote.
    bootstrap::apply_schema(&local, &[], true).await?;

    remote
        .exec(&format!(
            "CREATE TABLE \"{table}\" (\
               id SERIAL PRIMARY KEY, \
               note TEXT, \
               updated_at TIMESTAMPTZ NOT NULL)"
        ))
        .await?;
    remote
        .exec(&format!(
            "INSERT INTO \"{table}\" (note, updated_at) VALUES \
             ('january', '2024-01-01T00:00:00Z'), \
             ('june', '2024-06-01T00:00:00Z')"
        ))
        .await?;

    let shared = SyncShared::new(local, remote, Uuid::new_v4(), "updated_at".to_string());
    Ok(Some((shared, table)))
}

async fn teardown(shared: Arc<SyncShared>, table: &str) {
    let _ = shared
        .remote
        .exec(&format!("DROP TABLE IF EXISTS \"{table}\""))
        .await;
    shared.remote.close().await;
}

#[tokio::test]
async fn cutoff_keeps_only_newer_rows() -> anyhow::Result<()> {
    let Some((shared, table)) = setup().await? else { return Ok(()) };

    initial::run(&shared, Some("2024-03-01T00:00:00Z")).await?;

    let rows = shared
        .local
        .query(&format!("SELECT * FROM \"{table}\""), vec![])
        .await?;
    assert_eq!(rows.len(), 1, "only the June row passes the cutoff");
    assert_eq!(rows[0].get("note"), Some(&json!("june")));

    // Seeded rows never enter the outbox, and the high-water mark is set.
    assert_eq!(outbox::total_count(&shared.local).await?, 0);
    let state = outbox::sync_state(&shared.local).await?.expect("state row");
    assert!(state.get("last_pull").and_then(|v| v.as_str()).is_some());

    teardown(shared, &table).await;
    Ok(())
}

#[tokio::test]
async fn initial_sync_is_idempotent() -> anyhow::Result<()> {
    let Some((shared, table)) = setup().await? else { return Ok(()) };

    initial::run(&shared, None).await?;
    let first = shared
        .local
        .query(&format!("SELECT * FROM \"{table}\" ORDER BY id"), vec![])
        .await?;
    assert_eq!(first.len(), 2);

    initial::run(&shared, None).await?;
    let second = shared
        .local
        .query(&format!("SELECT * FROM \"{table}\" ORDER BY id"), vec![])
        .await?;
    assert_eq!(first, second, "a second run must not change local state");

    // Sequence alignment: the next local insert allocates past seeded ids.
    shared
        .local
        .exec(
            &format!(
                "INSERT INTO \"{table}\" (note, updated_at) VALUES ('local', '2024-07-01T00:00:00Z')"
            ),
            vec![],
        )
        .await?;
    let rows = shared
        .local
        .query(&format!("SELECT MAX(id) AS m FROM \"{table}\""), vec![])
        .await?;
    assert_eq!(rows[0].get("m"), Some(&json!(3)));

    teardown(shared, &table).await;
    Ok(())
}
