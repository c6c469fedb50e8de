use dh_pipeline::ContextManager;
use dh_types::{ChatRole, ChatTurn};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_missing_id_gets_fresh_uuid() {
    let manager = ContextManager::default();

    let (a, _) = manager.get_context(None).await;
    let (b, _) = manager.get_context(Some("   ")).await;

    assert!(uuid::Uuid::parse_str(&a).is_ok());
    assert!(uuid::Uuid::parse_str(&b).is_ok());
    assert_ne!(a, b);
    assert_eq!(manager.len().await, 2);
}

#[tokio::test]
async fn test_same_id_returns_same_context() {
    let manager = ContextManager::default();

    let (id, first) = manager.get_context(Some("session-1")).await;
    let (_, second) = manager.get_context(Some("session-1")).await;

    assert_eq!(id, "session-1");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn test_update_context_appends_in_order() {
    let manager = ContextManager::default();

    manager.update_context("s", ChatTurn::user("hi")).await;
    manager.update_context("s", ChatTurn::assistant("hello")).await;

    let snapshot = manager.snapshot("s").await.unwrap();
    assert_eq!(snapshot.context_id, "s");
    let roles: Vec<ChatRole> = snapshot.messages.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![ChatRole::User, ChatRole::Assistant]);
    assert_eq!(snapshot.messages[1].content, "hello");
}

#[tokio::test]
async fn test_snapshot_and_remove() {
    let manager = ContextManager::default();
    assert!(manager.snapshot("nope").await.is_none());
    assert!(!manager.remove("nope").await);

    manager.get_context(Some("gone")).await;
    assert!(manager.remove("gone").await);
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn test_reads_refresh_last_access() {
    let manager = ContextManager::default();
    let (id, _) = manager.get_context(Some("c")).await;
    let created = manager.snapshot(&id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.get_context(Some(id.as_str())).await;
    let after_get_context = manager.last_access(&id).await.unwrap();
    assert!(after_get_context > created.last_access);

    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.get(&id).await.unwrap();
    let snapshot = manager.snapshot(&id).await.unwrap();
    assert!(snapshot.last_access > after_get_context);
    assert_eq!(snapshot.created_at, created.created_at);
}

#[tokio::test]
async fn test_read_keeps_context_from_sweep() {
    let manager = ContextManager::default();
    manager.get_context(Some("read")).await;
    manager.get_context(Some("idle")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager.get("read").await.unwrap();

    let removed = manager.clear_old_contexts(Duration::from_millis(15)).await;

    assert_eq!(removed, 1);
    let snapshot = manager.snapshot("read").await.unwrap();
    assert_eq!(snapshot.context_id, "read");
    assert!(manager.last_access("idle").await.is_none());
}

#[tokio::test]
async fn test_clear_old_contexts_removes_idle() {
    let manager = ContextManager::default();
    manager.get_context(Some("old")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager.get_context(Some("fresh")).await;

    let removed = manager.clear_old_contexts(Duration::from_millis(15)).await;

    assert_eq!(removed, 1);
    assert!(manager.get("old").await.is_none());
    assert!(manager.get("fresh").await.is_some());
}

#[tokio::test]
async fn test_sweep_skips_context_in_use() {
    let manager = ContextManager::default();
    let (_, handle) = manager.get_context(Some("busy")).await;
    let guard = handle.lock().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(manager.clear_old_contexts(Duration::from_millis(5)).await, 0);
    assert_eq!(manager.len().await, 1);

    drop(guard);
    assert_eq!(manager.clear_old_contexts(Duration::from_millis(5)).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_turns_on_one_context_serialize() {
    let manager = Arc::new(ContextManager::default());

    let mut tasks = Vec::new();
    for n in 0..2 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let (_, handle) = manager.get_context(Some("shared")).await;
            let mut context = handle.lock().await;
            let seen = context.messages().len();
            // Simulated engine latency while holding the turn.
            tokio::time::sleep(Duration::from_millis(20)).await;
            context.append(ChatTurn::user(format!("question {n}")));
            context.append(ChatTurn::assistant(format!("answer {seen}")));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let snapshot = manager.snapshot("shared").await.unwrap();
    assert_eq!(snapshot.messages.len(), 4);
    let roles: Vec<ChatRole> = snapshot.messages.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![
            ChatRole::User,
            ChatRole::Assistant,
            ChatRole::User,
            ChatRole::Assistant
        ]
    );
    // The second turn saw the first turn's history.
    assert_eq!(snapshot.messages[1].content, "answer 0");
    assert_eq!(snapshot.messages[3].content, "answer 2");
}

#[tokio::test]
async fn test_least_recently_used_context_evicted() {
    let manager = ContextManager::new(Some(2));
    manager.get_context(Some("a")).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.get_context(Some("b")).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.get_context(Some("a")).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    manager.get_context(Some("c")).await;

    assert_eq!(manager.len().await, 2);
    assert!(manager.get("a").await.is_some());
    assert!(manager.get("b").await.is_none());
    assert!(manager.get("c").await.is_some());
}
