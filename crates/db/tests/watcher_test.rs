// crates/db/tests/watcher_test.rs
//! Watcher behavior: tracking external files, re-sync on replacement,
//! untracking on removal, and the wait-until-tracked gate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio_util::sync::CancellationToken;

use angel_core::Config;
use angel_db::{schema::SESSION_SCHEMA, SessionExec, Store};

async fn open_store_with_watcher() -> (tempfile::TempDir, Arc<Store>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::with_data_dir(dir.path());
    config.watcher_debounce = Duration::from_millis(50);
    config.poll_interval = Duration::from_millis(500);
    let store = Store::open(config).await.unwrap();
    store.start_watcher().await.unwrap();
    (dir, Arc::new(store))
}

/// Build a session DB file the way an external process would: same schema,
/// no involvement of the store under test.
fn write_external_session(path: &Path, messages: &[&str]) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(&SESSION_SCHEMA.replace("S.", "")).unwrap();
    conn.execute(
        "INSERT INTO sessions (id, created_at, last_updated_at, system_prompt, name,
                               primary_branch_id, chosen_first_id)
         VALUES ('', 1, 1, '', 'external', 1, 1)",
        [],
    )
    .unwrap();
    conn.execute("INSERT INTO branches (session_id) VALUES ('')", [])
        .unwrap();
    let mut previous: Option<i64> = None;
    for (i, text) in messages.iter().enumerate() {
        let ty = if i % 2 == 0 { "user" } else { "model" };
        conn.execute(
            "INSERT INTO messages (session_id, branch_id, parent_message_id, type, text, created_at)
             VALUES ('', 1, ?1, ?2, ?3, ?4)",
            params![previous, ty, text, i as i64 + 1],
        )
        .unwrap();
        let id = conn.last_insert_rowid();
        if let Some(prev) = previous {
            conn.execute(
                "UPDATE messages SET chosen_next_id = ?1 WHERE id = ?2",
                params![id, prev],
            )
            .unwrap();
        }
        previous = Some(id);
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn catalog_session_count(store: &Store, main_id: &str) -> i64 {
    store
        .catalog()
        .query_one(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1",
            params![main_id],
            |row| row.get(0),
        )
        .unwrap()
}

#[tokio::test]
async fn external_file_becomes_searchable() {
    // A file dropped into the session directory is tracked and projected
    // into the catalog with SI/SO escaping applied.
    let (_dir, store) = open_store_with_watcher().await;

    let path = store.session_db_path("WtaaAaaa");
    write_external_session(&path, &["ask about <widgets>", "widgets are <great>"]);

    assert!(
        wait_for(|| catalog_session_count(&store, "WtaaAaaa") == 1).await,
        "external session never tracked"
    );
    assert!(
        wait_for(|| {
            !angel_db::search::search_messages(&store.catalog(), "widgets", 10)
                .unwrap()
                .is_empty()
        })
        .await,
        "external messages never searchable"
    );

    // Stored text carries the control bytes, never raw angle brackets.
    let stored: String = store
        .catalog()
        .query_one(
            "SELECT text FROM messages_searchable WHERE session_id = 'WtaaAaaa' LIMIT 1",
            params![],
            |row| row.get(0),
        )
        .unwrap();
    assert!(!stored.contains('<'));
    assert!(stored.contains('\u{0E}'));

    store.shutdown().await;
}

#[tokio::test]
async fn replaced_file_is_resynced() {
    // Overwriting a tracked session DB out-of-band re-projects it.
    let (_dir, store) = open_store_with_watcher().await;

    let path = store.session_db_path("WtaaAaab");
    write_external_session(&path, &["original question"]);
    assert!(wait_for(|| catalog_session_count(&store, "WtaaAaab") == 1).await);

    // Detach before replacing the file underneath SQLite.
    store.pool().housekeep(Duration::ZERO);
    std::fs::remove_file(&path).unwrap();
    write_external_session(&path, &["original question", "zebra answer"]);

    assert!(
        wait_for(|| {
            angel_db::search::search_messages(&store.catalog(), "zebra", 10)
                .unwrap()
                .iter()
                .any(|h| h.session_id == "WtaaAaab")
        })
        .await,
        "replacement content never appeared in search"
    );

    store.shutdown().await;
}

#[tokio::test]
async fn removed_file_is_untracked() {
    let (_dir, store) = open_store_with_watcher().await;

    let path = store.session_db_path("WtaaAaac");
    write_external_session(&path, &["soon to vanish"]);
    assert!(wait_for(|| catalog_session_count(&store, "WtaaAaac") == 1).await);

    store.pool().housekeep(Duration::ZERO);
    std::fs::remove_file(&path).unwrap();

    assert!(
        wait_for(|| catalog_session_count(&store, "WtaaAaac") == 0).await,
        "removed session still in catalog"
    );
    let leftover: i64 = store
        .catalog()
        .query_one(
            "SELECT COUNT(*) FROM messages_searchable WHERE session_id = 'WtaaAaac'",
            params![],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(leftover, 0);

    store.shutdown().await;
}

#[tokio::test]
async fn startup_scan_tracks_preexisting_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::with_data_dir(dir.path());
    config.watcher_debounce = Duration::from_millis(50);
    std::fs::create_dir_all(&config.session_dir).unwrap();
    write_external_session(&config.session_dir.join("WtaaAaad.db"), &["pre-existing"]);

    let store = Store::open(config).await.unwrap();
    store.start_watcher().await.unwrap();

    assert!(wait_for(|| catalog_session_count(&store, "WtaaAaad") == 1).await);
    store.shutdown().await;
}

#[tokio::test]
async fn acquire_waits_until_tracked() {
    // An acquire for a file the watcher has not yet seen blocks, then
    // proceeds once tracking completes.
    let (_dir, store) = open_store_with_watcher().await;

    // Exercise the gate through the pool directly, with a file that is only
    // written after the acquire starts.
    let late_path = store.session_db_path("WtaaAaaf");
    let acquire = tokio::spawn({
        let store = store.clone();
        let late_path = late_path.clone();
        async move {
            let cancel = CancellationToken::new();
            store
                .pool()
                .acquire(&late_path, "WtaaAaaf", Default::default(), &cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!acquire.is_finished(), "acquire should wait for tracking");

    write_external_session(&late_path, &["late arrival"]);
    let lease = tokio::time::timeout(Duration::from_secs(5), acquire)
        .await
        .expect("acquire should finish once tracked")
        .unwrap()
        .unwrap();
    assert_eq!(lease.main_session_id(), "WtaaAaaf");
    drop(lease);

    store.shutdown().await;
}

#[tokio::test]
async fn search_index_rebuilds_from_disk() {
    let (_dir, store) = open_store_with_watcher().await;

    let path = store.session_db_path("WtaaAaah");
    write_external_session(&path, &["rebuild me please"]);
    assert!(wait_for(|| catalog_session_count(&store, "WtaaAaah") == 1).await);

    // Sabotage the projection; a rebuild restores it from the files.
    store
        .catalog()
        .execute("DELETE FROM message_stems", params![])
        .unwrap();
    store
        .catalog()
        .execute("DELETE FROM message_trigrams", params![])
        .unwrap();
    assert!(angel_db::search::search_messages(&store.catalog(), "rebuild", 10)
        .unwrap()
        .is_empty());

    let rebuilt = store.rebuild_search_index().await.unwrap();
    assert!(rebuilt >= 1);
    assert!(!angel_db::search::search_messages(&store.catalog(), "rebuild", 10)
        .unwrap()
        .is_empty());

    store.shutdown().await;
}

#[tokio::test]
async fn own_writes_do_not_retrigger_projection() {
    // The commit hook marks our writes as expected; the debounced event
    // clears the flag without touching the catalog, while the projection
    // made at write time stays correct.
    let (_dir, store) = open_store_with_watcher().await;

    let (handle, branch) = store.create_session("WtaaAaag", "p", None).await.unwrap();
    handle
        .transaction(|tx| {
            angel_db::append_message(tx, branch, &angel_db::NewMessage::user("own write"))
        })
        .unwrap();

    assert!(
        wait_for(|| {
            !angel_db::search::search_messages(&store.catalog(), "own", 10)
                .unwrap()
                .is_empty()
        })
        .await
    );

    // Give the debounced event time to fire and verify the row is intact.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(catalog_session_count(&store, "WtaaAaag"), 1);

    drop(handle);
    store.shutdown().await;
}
