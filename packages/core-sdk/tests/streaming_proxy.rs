//! 流式代理与恢复控制器的端到端测试：mockito 模拟上游，本地端口运行 axum 服务。

use std::{sync::Arc, time::Duration};

use inkwell_core_sdk::{
    classify::ErrorType,
    db::{SqliteStore, StoryStore},
    error::ProxyError,
    models::{BibleFields, Message, ProviderConfig},
    proxy::{create_stream_response, StreamRequest, STREAM_CONTENT_TYPE},
    recovery::{
        ByteStream, HttpTransport, RecoveryController, RecoveryOutcome, SuccessHandler,
        TransportResponse,
    },
    server::{router, AppState},
    telemetry::TelemetryContext,
};
use mockito::Matcher;
use serde_json::json;

fn delta(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"delta": {"content": content}}]})
    )
}

fn provider(server: &mockito::ServerGuard, model: &str) -> ProviderConfig {
    ProviderConfig {
        base_url: format!("{}/v1", server.url()),
        api_key: "sk-test".to_string(),
        model_id: model.to_string(),
    }
}

fn telemetry_ctx() -> TelemetryContext {
    TelemetryContext {
        user_id: "u1".to_string(),
        project_id: "p1".to_string(),
        document_id: Some("d1".to_string()),
        feature: "continue".to_string(),
        prompt: "写下去".to_string(),
    }
}

async fn spawn_app(store: Arc<SqliteStore>) -> String {
    let state = AppState::new(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_stream_skips_malformed_line_and_records_once() {
    let mut upstream = mockito::Server::new_async().await;
    let body = format!(
        "{}data: {{\"choices\":[{{\"delta\":{{\"content\":\"BROKEN\n\n{}data: [DONE]\n\n",
        delta("夜色"),
        delta("渐深。")
    );
    let mock = upstream
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({"stream": true, "model": "m-1"})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let shared: Arc<dyn StoryStore> = store.clone();
    let response = create_stream_response(
        &reqwest::Client::new(),
        StreamRequest {
            messages: vec![Message::user("写下去")],
            max_tokens: 64,
            temperature: 0.7,
            model_id: None,
            provider_config: Some(provider(&upstream, "m-1")),
        },
        telemetry_ctx(),
        shared,
    )
    .await
    .expect("stream response");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().expect("header"),
        STREAM_CONTENT_TYPE
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert_eq!(text, "夜色渐深。");
    mock.assert_async().await;

    let rows = store.list_ai_history("u1", "p1").expect("history");
    assert_eq!(rows.len(), 1);
    let record = &rows[0].record;
    assert_eq!(record.result, "夜色渐深。");
    assert_eq!(record.output_chars, 5);
    assert_eq!(record.model, "m-1");
    assert_eq!(record.document_id.as_deref(), Some("d1"));
    assert_eq!(record.response_fingerprint.len(), 64);
}

#[tokio::test]
async fn test_upstream_rejection_is_classified_without_telemetry() {
    let mut upstream = mockito::Server::new_async().await;
    let _mock = upstream
        .mock("POST", "/v1/chat/completions")
        .with_status(429)
        .with_body(r#"{"error":{"message":"quota exceeded"}}"#)
        .create_async()
        .await;

    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let shared: Arc<dyn StoryStore> = store.clone();
    let err = create_stream_response(
        &reqwest::Client::new(),
        StreamRequest {
            messages: vec![Message::user("hi")],
            max_tokens: 16,
            temperature: 0.5,
            model_id: None,
            provider_config: Some(provider(&upstream, "m-1")),
        },
        telemetry_ctx(),
        shared,
    )
    .await
    .unwrap_err();

    match err {
        ProxyError::Upstream {
            status,
            classification,
            ..
        } => {
            assert_eq!(status, 429);
            assert_eq!(classification.error_type, ErrorType::RateLimit);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(store.list_ai_history("u1", "p1").expect("history").is_empty());
}

#[tokio::test]
async fn test_route_rejects_missing_config_and_user() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let base = spawn_app(store).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/ai/continue", base))
        .json(&json!({"projectId": "p1", "prompt": "go"}))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);
    let v: serde_json::Value = resp.json().await.expect("json");
    assert!(v.get("errorType").is_none());

    let resp = client
        .post(format!("{}/api/ai/continue", base))
        .header("x-ai-base-url", "https://llm.example.com/v1")
        .header("x-ai-model-id", "m-1")
        .json(&json!({"projectId": "p1", "prompt": "go"}))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{}/api/health", base))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_switch_model_recovers_failed_completion() {
    let mut upstream = mockito::Server::new_async().await;
    let _missing = upstream
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::PartialJson(json!({"model": "ghost-model"})))
        .with_status(404)
        .with_body("model not found")
        .create_async()
        .await;
    let replacement = upstream
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::PartialJson(json!({"model": "gpt-4o"})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(format!("{}{}data: [DONE]\n\n", delta("灯"), delta("灭了。")))
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    store
        .upsert_bible(
            "p1",
            "u1",
            &BibleFields {
                genre: Some("悬疑".to_string()),
                ..Default::default()
            },
        )
        .expect("bible");
    let base = spawn_app(store.clone()).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let on_success: SuccessHandler = Arc::new(move |body: ByteStream| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let text = TransportResponse { status: 200, body }.text().await;
            let _ = tx.send(text);
        });
    });

    let held = provider(&upstream, "ghost-model");
    let transport = HttpTransport::new(reqwest::Client::new(), base, Some("u1".to_string()));
    let mut controller = RecoveryController::new(transport);

    let outcome = controller
        .issue(
            "/api/ai/continue",
            json!({"projectId": "p1", "prompt": "写下去"}),
            Some(&held),
            on_success,
        )
        .await;
    let error = match outcome {
        RecoveryOutcome::Failed(error) => error,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(error.error_type, ErrorType::ModelNotFound);
    let state = controller.state();
    assert!(!state.offers_retry());
    assert!(state.offers_switch());

    let outcome = controller
        .handle_switch_model(Some(&held), "gpt-4o", None)
        .await;
    assert!(matches!(outcome, RecoveryOutcome::Recovered { notice: Some(_) }));
    assert_eq!(held.model_id, "ghost-model");

    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timely body")
        .expect("body text");
    assert_eq!(text, "灯灭了。");
    replacement.assert_async().await;

    let rows = store.list_ai_history("u1", "p1").expect("history");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.model, "gpt-4o");
    assert_eq!(rows[0].record.output_chars, 4);
    assert_eq!(controller.state().error, None);
}

#[tokio::test]
async fn test_client_disconnect_still_records_partial_text_once() {
    let mut upstream = mockito::Server::new_async().await;
    let _mock = upstream
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(format!(
            "{}{}data: [DONE]\n\n",
            delta("夜色"),
            delta("渐深。")
        ))
        .create_async()
        .await;

    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let shared: Arc<dyn StoryStore> = store.clone();
    let response = create_stream_response(
        &reqwest::Client::new(),
        StreamRequest {
            messages: vec![Message::user("写下去")],
            max_tokens: 64,
            temperature: 0.7,
            model_id: None,
            provider_config: Some(provider(&upstream, "m-1")),
        },
        telemetry_ctx(),
        shared,
    )
    .await
    .expect("stream response");
    drop(response);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let rows = loop {
        let rows = store.list_ai_history("u1", "p1").expect("history");
        if !rows.is_empty() || tokio::time::Instant::now() >= deadline {
            break rows;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(store.list_ai_history("u1", "p1").expect("history").len(), 1);

    let record = &rows[0].record;
    assert!("夜色渐深。".starts_with(record.result.as_str()));
    assert_eq!(record.output_chars, record.result.chars().count() as i64);
    assert_eq!(record.model, "m-1");
}

#[tokio::test]
async fn test_unparseable_body_is_plain_json_error() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let base = spawn_app(store).await;
    let client = reqwest::Client::new();

    let malformed = client
        .post(format!("{}/api/ai/continue", base))
        .header("x-ai-base-url", "https://llm.example.com/v1")
        .header("x-ai-model-id", "m-1")
        .header("x-user-id", "u1")
        .header("content-type", "application/json")
        .body("{not json");
    let untyped = client
        .post(format!("{}/api/ai/continue", base))
        .header("x-ai-base-url", "https://llm.example.com/v1")
        .header("x-ai-model-id", "m-1")
        .header("x-user-id", "u1")
        .body(r#"{"projectId":"p1","prompt":"go"}"#);
    let saliency = client
        .post(format!("{}/api/ai/saliency", base))
        .header("content-type", "application/json")
        .body("[");

    for request in [malformed, untyped, saliency] {
        let resp = request.send().await.expect("send");
        assert_eq!(resp.status(), 400);
        let content_type = resp.headers()["content-type"]
            .to_str()
            .expect("header")
            .to_string();
        assert!(content_type.starts_with("application/json"), "{}", content_type);
        let v: serde_json::Value = resp.json().await.expect("json");
        assert!(v["error"].as_str().is_some_and(|e| !e.is_empty()));
        assert!(v.get("errorType").is_none());
    }
}
