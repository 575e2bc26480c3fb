// crates/db/tests/lifecycle_test.rs
//! Session lifecycle: create/delete fanout, temp cleanup, blobs, envs,
//! shell commands, sub-sessions, archived header.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio_util::sync::CancellationToken;

use angel_core::Config;
use angel_db::{
    append_message, blobs, envs, sessions, shell, NewMessage, SessionExec, Store, StoreError,
};
use angel_types::{Attachment, MessageType, ShellCommandStatus};

async fn open_store() -> (tempfile::TempDir, Arc<Store>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(Config::with_data_dir(dir.path()))
        .await
        .unwrap();
    (dir, Arc::new(store))
}

#[tokio::test]
async fn create_then_delete_leaves_nothing_behind() {
    // File gone, no catalog rows for the session or its subs, no FTS.
    let (_dir, store) = open_store().await;
    let (handle, branch) = store.create_session("LcaaAaaa", "p", None).await.unwrap();
    let path = store.session_db_path("LcaaAaaa");
    assert!(path.exists());

    handle
        .transaction(|tx| append_message(tx, branch, &NewMessage::user("searchable text")))
        .unwrap();

    // A sub-session row rides along in the same file.
    let sub = handle.with_suffix("tool1");
    sessions::create_sub_session(&sub, "sub prompt").unwrap();
    drop(sub);
    drop(handle);

    let catalog = store.catalog();
    let fts_rows: i64 = catalog
        .query_one(
            "SELECT COUNT(*) FROM messages_searchable WHERE session_id LIKE 'LcaaAaaa%'",
            params![],
            |row| row.get(0),
        )
        .unwrap();
    assert!(fts_rows > 0);

    store.delete_session("LcaaAaaa").await.unwrap();

    assert!(!path.exists());
    for table in ["sessions", "messages_searchable", "message_stems", "message_trigrams"] {
        let column = if table == "sessions" { "id" } else { "session_id" };
        let count: i64 = catalog
            .query_one(
                &format!("SELECT COUNT(*) FROM {table} WHERE {column} LIKE 'LcaaAaaa%'"),
                params![],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0, "{table} should be purged");
    }
}

#[tokio::test]
async fn creating_a_duplicate_session_conflicts() {
    let (_dir, store) = open_store().await;
    let (handle, _branch) = store.create_session("LcaaAaab", "p", None).await.unwrap();
    drop(handle);
    let err = store.create_session("LcaaAaab", "p", None).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn with_session_errors_on_unknown_or_missing_file() {
    let (_dir, store) = open_store().await;
    let cancel = CancellationToken::new();

    let err = store.with_session("ZzzzZzzz", &cancel).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    // Catalog row without the backing file is also NotFound.
    let (handle, _branch) = store.create_session("LcaaAaac", "p", None).await.unwrap();
    drop(handle);
    store.pool().force_detach("LcaaAaac").unwrap();
    std::fs::remove_file(store.session_db_path("LcaaAaac")).unwrap();
    let err = store.with_session("LcaaAaac", &cancel).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn workspace_deletion_fans_out_to_sessions() {
    let (_dir, store) = open_store().await;
    let workspace = store.create_workspace("dev", "be helpful").unwrap();

    for id in ["LcaaAaad", "LcaaAaae"] {
        let (handle, _branch) = store
            .create_session(id, "p", Some(&workspace.id))
            .await
            .unwrap();
        drop(handle);
    }

    store.delete_workspace(&workspace.id).await.unwrap();

    assert!(!store.session_db_path("LcaaAaad").exists());
    assert!(!store.session_db_path("LcaaAaae").exists());
    assert!(store.list_sessions(None).unwrap().is_empty());
    assert!(matches!(
        store.get_workspace(&workspace.id),
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn temporary_sessions_are_cleaned_up_after_idle() {
    let (_dir, store) = open_store().await;

    let (temp_handle, _branch) = store.create_session(".TmpAaaa", "p", None).await.unwrap();
    let (keep_handle, _branch) = store.create_session("LcaaAaaf", "p", None).await.unwrap();
    drop(temp_handle);
    drop(keep_handle);

    // Backdate the temporary session far past any TTL.
    store
        .catalog()
        .execute(
            "UPDATE sessions SET last_updated_at = 1 WHERE id = '.TmpAaaa'",
            params![],
        )
        .unwrap();

    let deleted = store
        .cleanup_old_temporary_sessions(Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(!store.session_db_path(".TmpAaaa").exists());
    assert!(store.session_db_path("LcaaAaaf").exists());
}

#[tokio::test]
async fn blob_refcounts_follow_message_lifecycles() {
    let (_dir, store) = open_store().await;
    let (handle, branch) = store.create_session("LcaaAaag", "p", None).await.unwrap();

    let hash = blobs::put_blob(&handle, b"image-bytes").unwrap();
    assert_eq!(blobs::blob_ref_count(&handle, &hash).unwrap(), Some(0));

    let attachment = Attachment::new(hash.clone());
    let first = handle
        .transaction(|tx| {
            append_message(
                tx,
                branch,
                &NewMessage::user("one").with_attachments(vec![attachment.clone()]),
            )
        })
        .unwrap();
    assert_eq!(blobs::blob_ref_count(&handle, &hash).unwrap(), Some(1));

    let second = handle
        .transaction(|tx| {
            append_message(
                tx,
                branch,
                &NewMessage::user("two").with_attachments(vec![attachment.clone()]),
            )
        })
        .unwrap();
    assert_eq!(blobs::blob_ref_count(&handle, &hash).unwrap(), Some(2));

    handle
        .execute("DELETE FROM S.messages WHERE id = ?1", params![second.id])
        .unwrap();
    assert_eq!(blobs::blob_ref_count(&handle, &hash).unwrap(), Some(1));

    handle
        .execute("DELETE FROM S.messages WHERE id = ?1", params![first.id])
        .unwrap();
    // The last dereference deletes the blob row entirely.
    assert_eq!(blobs::blob_ref_count(&handle, &hash).unwrap(), None);
    assert_eq!(blobs::get_blob(&handle, &hash).unwrap(), None);
}

#[tokio::test]
async fn unreferenced_blobs_can_be_purged() {
    let (_dir, store) = open_store().await;
    let (handle, _branch) = store.create_session("LcaaAaah", "p", None).await.unwrap();

    blobs::put_blob(&handle, b"orphan").unwrap();
    assert_eq!(blobs::purge_orphan_blobs(&handle).unwrap(), 1);
}

#[tokio::test]
async fn initial_env_can_only_be_set_once() {
    let (_dir, store) = open_store().await;
    let (handle, _branch) = store.create_session("LcaaAaai", "p", None).await.unwrap();

    envs::set_initial_env(&handle, &["/home/user/project".to_string()]).unwrap();
    let err = envs::set_initial_env(&handle, &["/elsewhere".to_string()]).unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let next = envs::push_env(&handle, &["/home/user/project".into(), "/extra".into()]).unwrap();
    assert_eq!(next, 1);

    let latest = envs::latest_env(&handle).unwrap().unwrap();
    assert_eq!(latest.generation, 1);
    assert_eq!(latest.roots.len(), 2);
    assert_eq!(
        envs::env_roots(&handle, 0).unwrap().unwrap(),
        vec!["/home/user/project".to_string()]
    );
}

#[tokio::test]
async fn shell_commands_move_through_the_status_machine() {
    let (_dir, store) = open_store().await;
    let (handle, branch) = store.create_session("LcaaAaaj", "p", None).await.unwrap();

    let cmd = shell::start_shell_command(&handle, branch, "cargo test").unwrap();
    assert_eq!(cmd.status, ShellCommandStatus::Running);

    shell::append_shell_output(&handle, cmd.id, shell::OutputStream::Stdout, b"line one\n")
        .unwrap();
    shell::append_shell_output(&handle, cmd.id, shell::OutputStream::Stdout, b"line two\n")
        .unwrap();
    shell::append_shell_output(&handle, cmd.id, shell::OutputStream::Stderr, b"warn\n").unwrap();

    // Incremental polling returns only bytes past the offsets.
    let first_poll = shell::poll_shell_output(&handle, cmd.id, 0, 0).unwrap();
    assert_eq!(first_poll.stdout, b"line one\nline two\n");
    assert_eq!(first_poll.stderr, b"warn\n");

    let second_poll =
        shell::poll_shell_output(&handle, cmd.id, first_poll.stdout_len, first_poll.stderr_len)
            .unwrap();
    assert!(second_poll.stdout.is_empty());
    assert!(second_poll.stderr.is_empty());

    shell::finish_shell_command(&handle, cmd.id, ShellCommandStatus::Completed, Some(0)).unwrap();
    let done = shell::get_shell_command(&handle, cmd.id).unwrap().unwrap();
    assert_eq!(done.status, ShellCommandStatus::Completed);
    assert_eq!(done.exit_code, Some(0));

    // Terminal states never transition again.
    let err =
        shell::finish_shell_command(&handle, cmd.id, ShellCommandStatus::Failed, Some(1))
            .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn failed_startup_is_a_terminal_state() {
    let (_dir, store) = open_store().await;
    let (handle, branch) = store.create_session("LcaaAaak", "p", None).await.unwrap();

    let cmd = shell::start_shell_command(&handle, branch, "/missing/binary").unwrap();
    shell::finish_shell_command(&handle, cmd.id, ShellCommandStatus::FailedOnStartup, None)
        .unwrap();
    let done = shell::get_shell_command(&handle, cmd.id).unwrap().unwrap();
    assert_eq!(done.status, ShellCommandStatus::FailedOnStartup);
}

#[tokio::test]
async fn sub_sessions_are_scoped_within_the_shared_file() {
    let (_dir, store) = open_store().await;
    let (handle, main_branch) = store.create_session("LcaaAaal", "p", None).await.unwrap();

    let sub = handle.with_suffix("worker");
    let sub_branch = sessions::create_sub_session(&sub, "sub prompt").unwrap();

    handle
        .transaction(|tx| append_message(tx, main_branch, &NewMessage::user("main msg")))
        .unwrap();
    sub.transaction(|tx| append_message(tx, sub_branch, &NewMessage::user("sub msg")))
        .unwrap();

    let main_page = angel_db::history(&handle, &Default::default()).unwrap();
    let sub_page = angel_db::history(&sub, &Default::default()).unwrap();
    assert_eq!(main_page.messages.len(), 1);
    assert_eq!(main_page.messages[0].message.text, "main msg");
    assert_eq!(sub_page.messages.len(), 1);
    assert_eq!(sub_page.messages[0].message.text, "sub msg");

    let sub_meta = sessions::session_meta(&sub).unwrap();
    assert_eq!(sub_meta.id, "LcaaAaal.worker");
}

#[tokio::test]
async fn archived_flag_round_trips_through_the_header() {
    let (_dir, store) = open_store().await;
    let (handle, _branch) = store.create_session("LcaaAaam", "p", None).await.unwrap();

    sessions::set_archived(&handle, true).unwrap();
    drop(handle);
    store.pool().force_detach("LcaaAaam").unwrap();

    let path = store.session_db_path("LcaaAaam");
    assert!(sessions::is_archived(&path).unwrap());
    assert_eq!(
        sessions::read_application_id(&path).unwrap(),
        sessions::APPLICATION_ID_ARCHIVED
    );

    let cancel = CancellationToken::new();
    let handle = store.with_session("LcaaAaam", &cancel).await.unwrap();
    sessions::set_archived(&handle, false).unwrap();
    drop(handle);
    store.pool().force_detach("LcaaAaam").unwrap();
    assert!(!sessions::is_archived(&path).unwrap());
}

#[tokio::test]
async fn message_writes_keep_the_catalog_projection_current() {
    let (_dir, store) = open_store().await;
    let (handle, branch) = store.create_session("LcaaAaan", "p", None).await.unwrap();

    handle
        .transaction(|tx| {
            append_message(tx, branch, &NewMessage::user("find the <needle> here"))
        })
        .unwrap();

    // Search goes through the escaped projection and unescapes on the way
    // out, for the in-process write path.
    let hits =
        angel_db::search::search_messages(&store.catalog(), "needle", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].session_id, "LcaaAaan");

    let stored: String = store
        .catalog()
        .query_one(
            "SELECT text FROM messages_searchable WHERE session_id = 'LcaaAaan'",
            params![],
            |row| row.get(0),
        )
        .unwrap();
    assert!(!stored.contains('<'));
    assert!(stored.contains('\u{0E}'));

    // Non-searchable types stay out of the projection.
    handle
        .transaction(|tx| {
            append_message(
                tx,
                branch,
                &NewMessage::of_type(MessageType::Thought, "internal"),
            )
        })
        .unwrap();
    let count: i64 = store
        .catalog()
        .query_one(
            "SELECT COUNT(*) FROM messages_searchable WHERE session_id = 'LcaaAaan'",
            params![],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}
