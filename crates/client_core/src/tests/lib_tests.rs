use super::*;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode as AxumStatus,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tokio::net::TcpListener;

use crate::auth::{MissingTokenProvider, StaticTokenProvider};

#[derive(Clone, Default)]
struct TestBackend {
    history: Arc<StdMutex<Vec<ChatMessage>>>,
    history_delay_ms: Arc<StdMutex<u64>>,
    reject_history: Arc<AtomicBool>,
    history_requests: Arc<AtomicUsize>,
    reject_sends: Arc<AtomicBool>,
    send_delay_ms: Arc<StdMutex<u64>>,
    failing_deletes: Arc<StdMutex<HashSet<String>>>,
    typing_signals: Arc<StdMutex<Vec<(String, UserId)>>>,
}

async fn list_messages(
    State(backend): State<TestBackend>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let delay = *backend.history_delay_ms.lock().expect("lock");
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    backend.history_requests.fetch_add(1, Ordering::SeqCst);
    if backend.reject_history.load(Ordering::SeqCst) {
        return (
            AxumStatus::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "message": "history unavailable" })),
        )
            .into_response();
    }
    let participant = params.get("participantId").cloned().unwrap_or_default();
    let messages: Vec<ChatMessage> = backend
        .history
        .lock()
        .expect("lock")
        .iter()
        .filter(|message| {
            message.sender_id.as_str() == participant || message.receiver_id.as_str() == participant
        })
        .cloned()
        .collect();
    Json(messages).into_response()
}

async fn create_message(
    State(backend): State<TestBackend>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    let delay = *backend.send_delay_ms.lock().expect("lock");
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if backend.reject_sends.load(Ordering::SeqCst) {
        return (
            AxumStatus::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "message": "send rejected" })),
        )
            .into_response();
    }
    let id = format!("srv-{}", backend.history.lock().expect("lock").len() + 1);
    let created = ChatMessage {
        id: MessageId::from(id.as_str()),
        sender_id: request.sender_id,
        receiver_id: request.receiver_id,
        content: request.content,
        message_type: request.message_type,
        created_at: Utc::now(),
        read_status: false,
    };
    backend.history.lock().expect("lock").push(created.clone());
    Json(created).into_response()
}

async fn remove_message(State(backend): State<TestBackend>, Path(id): Path<String>) -> Response {
    if backend.failing_deletes.lock().expect("lock").contains(&id) {
        return (
            AxumStatus::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "message": "delete refused" })),
        )
            .into_response();
    }
    backend
        .history
        .lock()
        .expect("lock")
        .retain(|message| message.id.as_str() != id);
    AxumStatus::NO_CONTENT.into_response()
}

async fn record_typing(
    State(backend): State<TestBackend>,
    Json(signal): Json<TypingSignal>,
) -> AxumStatus {
    let action = match signal.action {
        TypingAction::Start => "start",
        TypingAction::Stop => "stop",
    };
    backend
        .typing_signals
        .lock()
        .expect("lock")
        .push((action.to_string(), signal.target_user_id));
    AxumStatus::NO_CONTENT
}

async fn spawn_backend(backend: TestBackend) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/chat_messages", get(list_messages).post(create_message))
        .route("/chat_messages/:id", delete(remove_message))
        .route("/pusher/typing", post(record_typing))
        .with_state(backend);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn engine_for(base_url: String) -> Arc<ConversationSyncEngine> {
    let config = ClientConfig {
        api_base_url: base_url,
        typing_debounce: Duration::from_millis(40),
        clear_chat_delay: Duration::from_millis(1),
        ..ClientConfig::default()
    };
    let tokens = Arc::new(StaticTokenProvider::new(UserId::from("auth0|me"), "token"));
    ConversationSyncEngine::new(config, tokens)
}

fn message(id: &str, sender: &str, receiver: &str, created_at: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        sender_id: UserId::from(sender),
        receiver_id: UserId::from(receiver),
        content: format!("content-{id}"),
        message_type: "text".to_string(),
        created_at: created_at.parse().expect("timestamp"),
        read_status: false,
    }
}

async fn wait_for(
    engine: &Arc<ConversationSyncEngine>,
    predicate: impl Fn(&ConversationSnapshot) -> bool,
) -> ConversationSnapshot {
    for _ in 0..200 {
        let snapshot = engine.snapshot().await;
        if predicate(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let last = engine.snapshot().await;
    panic!("condition not reached; last snapshot: {last:?}");
}

#[tokio::test]
async fn history_is_displayed_ascending_regardless_of_server_order() {
    let backend = TestBackend::default();
    backend.history.lock().expect("lock").extend([
        message("m1", "github|204113180", "auth0|me", "2024-01-01T10:00:00Z"),
        message("m2", "github|204113180", "auth0|me", "2024-01-01T09:00:00Z"),
    ]);
    let engine = engine_for(spawn_backend(backend).await);

    engine
        .select_conversation(Some(UserId::from("github|204113180")))
        .await;
    let snapshot = wait_for(&engine, |s| s.messages.len() == 2).await;

    assert_eq!(snapshot.messages[0].id.as_str(), "m2");
    assert_eq!(snapshot.messages[1].id.as_str(), "m1");
}

#[tokio::test]
async fn loading_shows_only_while_the_list_is_empty() {
    let backend = TestBackend::default();
    backend.history.lock().expect("lock").push(message(
        "m1",
        "partner-a",
        "auth0|me",
        "2024-01-01T08:00:00Z",
    ));
    *backend.history_delay_ms.lock().expect("lock") = 50;
    let engine = engine_for(spawn_backend(backend).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    let during = wait_for(&engine, |s| s.loading).await;
    assert!(during.messages.is_empty());
    wait_for(&engine, |s| !s.loading && s.messages.len() == 1).await;

    // a background refresh over existing messages must not flash loading
    let mut changes = engine.subscribe_changes();
    engine.fetch_history().await;
    while let Ok(event) = changes.try_recv() {
        assert!(
            !matches!(event, EngineEvent::LoadingChanged(true)),
            "background refresh flashed a loading state"
        );
    }
    assert!(!engine.snapshot().await.loading);
}

#[tokio::test]
async fn fetch_failure_preserves_the_last_known_list() {
    let backend = TestBackend::default();
    backend.history.lock().expect("lock").push(message(
        "m1",
        "partner-a",
        "auth0|me",
        "2024-01-01T08:00:00Z",
    ));
    let engine = engine_for(spawn_backend(backend.clone()).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    wait_for(&engine, |s| s.messages.len() == 1).await;

    backend.reject_history.store(true, Ordering::SeqCst);
    engine.fetch_history().await;

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.messages.len(), 1);
    let error = snapshot.error.expect("error state must be set");
    assert!(error.contains("history unavailable"), "got: {error}");
}

#[tokio::test]
async fn stale_history_for_a_previous_partner_never_lands() {
    let backend = TestBackend::default();
    backend.history.lock().expect("lock").extend([
        message("a1", "partner-a", "auth0|me", "2024-01-01T08:00:00Z"),
        message("b1", "partner-b", "auth0|me", "2024-01-01T08:30:00Z"),
    ]);
    *backend.history_delay_ms.lock().expect("lock") = 150;
    let engine = engine_for(spawn_backend(backend.clone()).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // switch while partner-a's fetch is still in flight
    *backend.history_delay_ms.lock().expect("lock") = 0;
    engine
        .select_conversation(Some(UserId::from("partner-b")))
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.partner_id, Some(UserId::from("partner-b")));
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(
        snapshot.messages[0].id.as_str(),
        "b1",
        "stale partner-a history overwrote partner-b's view"
    );
}

#[tokio::test]
async fn send_appends_optimistically_and_keeps_the_entry_until_refetch() {
    let backend = TestBackend::default();
    let engine = engine_for(spawn_backend(backend).await);

    let created = engine
        .send_message(&UserId::from("u2"), "hello")
        .await
        .expect("send");

    assert_eq!(created.content, "hello");
    assert!(!created.id.is_local());
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.messages.len(), 1);
    assert!(
        snapshot.messages[0].id.is_local(),
        "optimistic entry is reconciled by refetch, not patched in place"
    );
}

#[tokio::test]
async fn failed_send_briefly_shows_then_removes_the_optimistic_entry() {
    let backend = TestBackend::default();
    backend.reject_sends.store(true, Ordering::SeqCst);
    *backend.send_delay_ms.lock().expect("lock") = 100;
    let engine = engine_for(spawn_backend(backend).await);

    let sender = Arc::clone(&engine);
    let send_task =
        tokio::spawn(async move { sender.send_message(&UserId::from("u2"), "hi").await });

    // the optimistic entry is visible while the request is in flight
    let during = wait_for(&engine, |s| s.messages.len() == 1).await;
    assert!(during.messages[0].id.is_local());

    let result = send_task.await.expect("join");
    let err = result.expect_err("send must fail");
    assert!(matches!(
        err,
        ChatError::BackendRejected { status: 500, .. }
    ));
    assert!(engine.snapshot().await.messages.is_empty());
}

#[tokio::test]
async fn send_requires_a_session() {
    let backend = TestBackend::default();
    let config = ClientConfig {
        api_base_url: spawn_backend(backend).await,
        ..ClientConfig::default()
    };
    let engine = ConversationSyncEngine::new(config, Arc::new(MissingTokenProvider));

    let err = engine
        .send_message(&UserId::from("u2"), "hi")
        .await
        .expect_err("must fail");

    assert!(matches!(err, ChatError::NotAuthenticated));
    assert!(engine.snapshot().await.messages.is_empty());
}

#[tokio::test]
async fn successful_delete_removes_locally_without_a_refetch() {
    let backend = TestBackend::default();
    backend.history.lock().expect("lock").extend([
        message("m1", "partner-a", "auth0|me", "2024-01-01T08:00:00Z"),
        message("m2", "partner-a", "auth0|me", "2024-01-01T09:00:00Z"),
    ]);
    let engine = engine_for(spawn_backend(backend.clone()).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    wait_for(&engine, |s| s.messages.len() == 2).await;
    let fetches_before = backend.history_requests.load(Ordering::SeqCst);

    engine
        .delete_message(&MessageId::from("m1"))
        .await
        .expect("delete");

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id.as_str(), "m2");
    assert_eq!(
        backend.history_requests.load(Ordering::SeqCst),
        fetches_before
    );
}

#[tokio::test]
async fn failed_delete_leaves_the_message_in_place() {
    let backend = TestBackend::default();
    backend.history.lock().expect("lock").push(message(
        "m1",
        "partner-a",
        "auth0|me",
        "2024-01-01T08:00:00Z",
    ));
    backend
        .failing_deletes
        .lock()
        .expect("lock")
        .insert("m1".to_string());
    let engine = engine_for(spawn_backend(backend).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    wait_for(&engine, |s| s.messages.len() == 1).await;

    let err = engine
        .delete_message(&MessageId::from("m1"))
        .await
        .expect_err("delete must fail");

    assert!(matches!(err, ChatError::BackendRejected { .. }));
    assert_eq!(engine.snapshot().await.messages.len(), 1);
}

#[tokio::test]
async fn clear_chat_continues_past_failures_and_reports_them() {
    let backend = TestBackend::default();
    backend.history.lock().expect("lock").extend([
        message("m1", "partner-a", "auth0|me", "2024-01-01T08:00:00Z"),
        message("m2", "partner-a", "auth0|me", "2024-01-01T09:00:00Z"),
        message("m3", "partner-a", "auth0|me", "2024-01-01T10:00:00Z"),
    ]);
    backend
        .failing_deletes
        .lock()
        .expect("lock")
        .insert("m2".to_string());
    let engine = engine_for(spawn_backend(backend).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    wait_for(&engine, |s| s.messages.len() == 3).await;

    let mut progress = Vec::new();
    let summary = engine
        .clear_chat_with_progress(|update| progress.push(update))
        .await
        .expect("clear runs to completion");

    assert!(!summary.success);
    assert_eq!(summary.deleted, 2);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].message_id.as_str(), "m2");

    assert_eq!(progress.len(), 3);
    let last = progress.last().expect("progress reported");
    assert_eq!((last.deleted, last.total, last.errors), (2, 3, 1));

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id.as_str(), "m2");
}

#[tokio::test]
async fn remote_typing_tracks_only_the_current_partner() {
    let backend = TestBackend::default();
    let engine = engine_for(spawn_backend(backend).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;

    engine
        .handle_remote_typing(UserId::from("partner-b"), true)
        .await;
    assert!(!engine.snapshot().await.partner_typing);

    engine
        .handle_remote_typing(UserId::from("partner-a"), true)
        .await;
    assert!(engine.snapshot().await.partner_typing);

    // switching always clears the flag, even without a stop event
    engine
        .select_conversation(Some(UserId::from("partner-b")))
        .await;
    assert!(!engine.snapshot().await.partner_typing);
}

#[tokio::test]
async fn typing_burst_emits_one_start_then_one_stop() {
    let backend = TestBackend::default();
    let engine = engine_for(spawn_backend(backend.clone()).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    engine.notify_input_changed("h").await;
    engine.notify_input_changed("he").await;
    engine.notify_input_changed("hey").await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let signals: Vec<String> = backend
        .typing_signals
        .lock()
        .expect("lock")
        .iter()
        .filter(|(_, target)| target.as_str() == "partner-a")
        .map(|(action, _)| action.clone())
        .collect();
    assert_eq!(signals, ["start", "stop"]);
}

#[tokio::test]
async fn submit_stops_typing_immediately() {
    let backend = TestBackend::default();
    let engine = engine_for(spawn_backend(backend.clone()).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    engine.notify_input_changed("draft").await;
    engine.notify_message_submitted().await;

    let signals_now: Vec<String> = backend
        .typing_signals
        .lock()
        .expect("lock")
        .iter()
        .map(|(action, _)| action.clone())
        .collect();
    assert_eq!(signals_now, ["start", "stop"]);

    // the cancelled deadline must not fire a second stop later
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.typing_signals.lock().expect("lock").len(), 2);
}

#[tokio::test]
async fn pushed_message_for_the_current_partner_triggers_a_refetch() {
    let backend = TestBackend::default();
    backend.history.lock().expect("lock").push(message(
        "m1",
        "partner-a",
        "auth0|me",
        "2024-01-01T08:00:00Z",
    ));
    let engine = engine_for(spawn_backend(backend.clone()).await);

    engine
        .select_conversation(Some(UserId::from("partner-a")))
        .await;
    wait_for(&engine, |s| s.messages.len() == 1).await;

    let pushed = message("m2", "partner-a", "auth0|me", "2024-01-01T09:00:00Z");
    backend.history.lock().expect("lock").push(pushed.clone());
    engine.handle_new_message(pushed).await;

    let snapshot = wait_for(&engine, |s| s.messages.len() == 2).await;
    assert_eq!(snapshot.messages[1].id.as_str(), "m2");

    // a push for someone else's conversation is ignored
    let fetches_before = backend.history_requests.load(Ordering::SeqCst);
    engine
        .handle_new_message(message(
            "x1",
            "partner-z",
            "auth0|me",
            "2024-01-01T10:00:00Z",
        ))
        .await;
    assert_eq!(
        backend.history_requests.load(Ordering::SeqCst),
        fetches_before
    );
}

#[tokio::test]
async fn fetch_without_a_partner_is_a_silent_no_op() {
    let backend = TestBackend::default();
    let engine = engine_for(spawn_backend(backend.clone()).await);

    engine.fetch_history().await;

    let snapshot = engine.snapshot().await;
    assert!(snapshot.error.is_none());
    assert!(!snapshot.loading);
    assert_eq!(backend.history_requests.load(Ordering::SeqCst), 0);
}
