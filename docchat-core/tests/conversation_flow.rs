//! End-to-end flows through `ConversationController` over HTTP.

use std::sync::Arc;

use docchat_core::models::{Role, UploadFile};
use docchat_core::{
    ClientConfig, Completion, ConversationController, Delivery, MemoryNavigator, Phase, Route,
    SubmitOutcome,
};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn controller(server: &MockServer) -> (ConversationController, Arc<MemoryNavigator>) {
    let mut config = ClientConfig::default().with_base_url(server.uri());
    config.api.max_retries = 0;
    let navigator = Arc::new(MemoryNavigator::new());
    let controller = ConversationController::connect(&config, navigator.clone()).unwrap();
    (controller, navigator)
}

fn event_stream(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body.to_string())
}

fn document(name: &str, size: u64) -> serde_json::Value {
    json!({
        "filename": name,
        "size": size,
        "uploaded_at": "2024-05-01T10:00:00.123456",
        "content_type": "application/pdf"
    })
}

#[tokio::test]
async fn test_first_message_streams_into_new_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chats"))
        .and(body_json(json!({"title": "hi"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "s1",
            "title": "hi",
            "updated_at": "2024-05-01T10:00:00"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chats/s1/message"))
        .and(body_json(json!({"message": "hi"})))
        .respond_with(event_stream(
            "data: {\"token\":\"He\"}\n\ndata: {\"token\":\"llo\"}\n\ndata: [DONE]\n\n",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "s1", "title": "hi", "updated_at": "2024-05-01T10:00:05"}
        ])))
        .mount(&server)
        .await;

    let (controller, navigator) = controller(&server);
    let outcome = controller.submit("hi").await;

    assert_eq!(outcome, SubmitOutcome::Completed(Completion::Confirmed));
    let view = controller.snapshot().await;
    assert_eq!(view.phase, Phase::Ready);
    assert_eq!(view.active_session.as_deref(), Some("s1"));
    assert_eq!(navigator.current(), Route::Session("s1".to_string()));

    let last = view.last_message().unwrap();
    assert_eq!(last.role(), Role::Assistant);
    assert_eq!(last.content(), "Hello");
    assert_eq!(last.delivery, Delivery::Confirmed);
    assert_eq!(view.sessions.len(), 1);
}

#[tokio::test]
async fn test_upload_with_duplicate_lists_each_file_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chats/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [],
            "documents": [document("b.pdf", 10)]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chats/s1/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": "s1",
            "uploaded_count": 2,
            "skipped_count": 1,
            "failed_count": 0,
            "skipped_files": ["b.pdf"],
            "failed_files": []
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/chats/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                {"role": "system", "content": "User uploaded files: a.pdf, c.pdf", "timestamp": "2024-05-01T10:01:00"}
            ],
            "documents": [document("b.pdf", 10), document("a.pdf", 4), document("c.pdf", 4)]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "s1", "title": "Docs", "updated_at": "2024-05-01T10:01:00"}
        ])))
        .mount(&server)
        .await;

    let (controller, _) = controller(&server);
    controller.open_route(Some("s1")).await.unwrap();

    let files = vec![
        UploadFile::new("a.pdf", b"aaaa".to_vec()),
        UploadFile::new("b.pdf", b"bbbb".to_vec()),
        UploadFile::new("c.pdf", b"cccc".to_vec()),
    ];
    let outcome = controller.upload(&files).await.unwrap();

    assert_eq!(outcome.uploaded_count(), 2);
    assert_eq!(outcome.skipped, vec!["b.pdf".to_string()]);
    assert_eq!(outcome.failed_count(), 0);

    let view = controller.snapshot().await;
    let mut names: Vec<&str> = view.documents.iter().map(|d| d.filename.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["a.pdf", "b.pdf", "c.pdf"]);
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].role(), Role::System);
}

#[tokio::test]
async fn test_renamed_session_keeps_id_and_title_after_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "s7", "title": "New Chat", "updated_at": "2024-05-01T09:00:00"}
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/chats/s7"))
        .and(body_json(json!({"title": "Contract review"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "s7", "title": "Contract review"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "s7", "title": "Contract review", "updated_at": "2024-05-01T09:05:00"}
        ])))
        .mount(&server)
        .await;

    let (controller, _) = controller(&server);
    controller.load_sessions().await.unwrap();
    controller
        .rename_session("s7", "Contract review")
        .await
        .unwrap();
    controller.load_sessions().await.unwrap();

    let view = controller.snapshot().await;
    let session = view.sessions.get("s7").unwrap();
    assert_eq!(session.title, "Contract review");
    assert_eq!(view.sessions.len(), 1);
}

#[tokio::test]
async fn test_deleted_session_route_shows_empty_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chats/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "detail": "Chat session not found"
        })))
        .mount(&server)
        .await;

    let (controller, navigator) = controller(&server);
    assert!(controller.open_route(Some("gone")).await.is_err());

    let view = controller.snapshot().await;
    assert_eq!(view.phase, Phase::Empty);
    assert!(view.messages.is_empty());
    assert_eq!(navigator.current(), Route::Home);
}
