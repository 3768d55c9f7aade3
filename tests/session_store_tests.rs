use agentry::session_store::SessionStore;
use chrono::Duration;
use std::path::PathBuf;

fn store() -> SessionStore {
    SessionStore::in_memory(Duration::hours(1), 5)
}

#[tokio::test]
async fn create_session_is_idempotent() {
    let store = store();
    let id = store.create_session(Some("s1")).await.unwrap();
    assert_eq!(id, "s1");

    store
        .append_message("s1", "user", "hello", serde_json::json!({}))
        .await
        .unwrap();

    // Second create is a no-op: the message survives.
    let again = store.create_session(Some("s1")).await.unwrap();
    assert_eq!(again, "s1");
    let session = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.message_count, 1);
}

#[tokio::test]
async fn generated_ids_are_unique() {
    let store = store();
    let a = store.create_session(None).await.unwrap();
    let b = store.create_session(None).await.unwrap();
    assert_ne!(a, b);
    assert!(store.session_exists(&a).await.unwrap());
}

#[tokio::test]
async fn message_count_tracks_list_length() {
    let store = store();
    store.create_session(Some("s")).await.unwrap();
    for i in 0..3 {
        store
            .append_message("s", "user", &format!("msg {}", i), serde_json::json!({}))
            .await
            .unwrap();
        let session = store.get_session("s").await.unwrap().unwrap();
        let messages = store.all_messages("s").await.unwrap();
        assert_eq!(session.message_count, messages.len());
    }
}

#[tokio::test]
async fn oldest_messages_evicted_past_cap() {
    let store = store(); // cap = 5
    store.create_session(Some("s")).await.unwrap();
    for i in 0..8 {
        store
            .append_message("s", "user", &format!("msg {}", i), serde_json::json!({}))
            .await
            .unwrap();
    }
    let messages = store.all_messages("s").await.unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0].content, "msg 3");
    assert_eq!(messages[4].content, "msg 7");

    let session = store.get_session("s").await.unwrap().unwrap();
    assert_eq!(session.message_count, 5);
}

#[tokio::test]
async fn recent_context_returns_all_when_n_exceeds_length() {
    let store = store();
    store.create_session(Some("s")).await.unwrap();
    store
        .append_message("s", "user", "one", serde_json::json!({}))
        .await
        .unwrap();
    store
        .append_message("s", "assistant", "two", serde_json::json!({}))
        .await
        .unwrap();

    let context = store.recent_context("s", 50).await.unwrap();
    assert_eq!(context.len(), 2);
    assert_eq!(context[0].content, "one");
    assert_eq!(context[1].content, "two");
}

#[tokio::test]
async fn context_scratchpad_round_trips() {
    let store = store();
    store.create_session(Some("s")).await.unwrap();

    store
        .set_context("s", "pending_task", serde_json::json!("research rust"))
        .await
        .unwrap();
    let value = store.get_context("s", "pending_task").await.unwrap().unwrap();
    assert_eq!(value, serde_json::json!("research rust"));

    store
        .set_context("s", "hints", serde_json::json!({"retries": 3}))
        .await
        .unwrap();
    let map = store.context_map("s").await.unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map["hints"]["retries"], 3);
}

#[tokio::test]
async fn workflow_records_update_active_workflow() {
    let store = store();
    store.create_session(Some("s")).await.unwrap();

    let record = serde_json::json!({"id": "wf-1", "status": "running"});
    store.save_workflow("s", "wf-1", record.clone()).await.unwrap();

    assert_eq!(store.get_workflow("s", "wf-1").await.unwrap().unwrap(), record);
    let session = store.get_session("s").await.unwrap().unwrap();
    assert_eq!(session.active_workflow.as_deref(), Some("wf-1"));
}

#[tokio::test]
async fn expired_sessions_disappear() {
    let store = SessionStore::in_memory(Duration::zero(), 5);
    store.create_session(Some("s")).await.unwrap();
    // TTL of zero: any later access finds the session expired.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(store.get_session("s").await.unwrap().is_none());
    assert!(!store.session_exists("s").await.unwrap());
}

#[tokio::test]
async fn delete_session_clears_everything() {
    let store = store();
    store.create_session(Some("s")).await.unwrap();
    store
        .append_message("s", "user", "x", serde_json::json!({}))
        .await
        .unwrap();
    store
        .set_context("s", "k", serde_json::json!(1))
        .await
        .unwrap();

    store.delete_session("s").await.unwrap();
    assert!(!store.session_exists("s").await.unwrap());
    assert!(store.all_messages("s").await.unwrap().is_empty());
    assert!(store.get_context("s", "k").await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_backend_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sessions.db");

    {
        let store = SessionStore::open(&db, Duration::hours(1), 100);
        assert!(store.is_durable());
        store.create_session(Some("s")).await.unwrap();
        store
            .append_message("s", "user", "persisted", serde_json::json!({"k": "v"}))
            .await
            .unwrap();
    }

    let store = SessionStore::open(&db, Duration::hours(1), 100);
    let messages = store.all_messages("s").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "persisted");
    assert_eq!(messages[0].metadata["k"], "v");
}

#[tokio::test]
async fn unopenable_database_falls_back_to_memory() {
    // A directory path can never be opened as a database file.
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(&PathBuf::from(dir.path()), Duration::hours(1), 100);
    assert!(!store.is_durable());

    // The fallback still satisfies the interface and the count invariant.
    store.create_session(Some("s")).await.unwrap();
    store
        .append_message("s", "user", "still works", serde_json::json!({}))
        .await
        .unwrap();
    let session = store.get_session("s").await.unwrap().unwrap();
    assert_eq!(session.message_count, store.all_messages("s").await.unwrap().len());
}
