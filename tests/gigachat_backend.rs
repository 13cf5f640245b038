//! GigaChat backend against a mock OAuth and completions server.

use chatrelay::config::LlmConfig;
use chatrelay::gate::{classify_error, ErrorClass};
use chatrelay::providers::{BackendRegistry, ChatBackend, ChatMessage, GigaChatBackend};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, body_string, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AUTH_KEY: &str = "Y2xpZW50OnNlY3JldA==";

fn far_future_ms() -> i64 {
    chrono::Utc::now().timestamp_millis() + 30 * 60 * 1000
}

fn token(value: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": value,
        "expires_at": far_future_ms()
    }))
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": content}, "index": 0}],
        "model": "GigaChat"
    }))
}

fn backend(server: &MockServer) -> GigaChatBackend {
    GigaChatBackend::new(AUTH_KEY, "GigaChat", Duration::from_secs(5))
        .with_base_url(&format!("{}/api/v1", server.uri()))
        .with_auth_url(&format!("{}/api/v2/oauth", server.uri()))
}

#[tokio::test]
async fn token_is_fetched_once_and_reused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/oauth"))
        .and(header("Authorization", format!("Basic {AUTH_KEY}").as_str()))
        .and(header_exists("RqUID"))
        .and(body_string("scope=GIGACHAT_API_PERS"))
        .respond_with(token("tok-1"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .and(header("Authorization", "Bearer tok-1"))
        .and(body_partial_json(json!({"model": "GigaChat", "stream": false})))
        .respond_with(completion("Здравствуйте!"))
        .expect(2)
        .mount(&server)
        .await;

    let backend = backend(&server);
    for _ in 0..2 {
        let reply = backend
            .chat(&[ChatMessage::user("привет")], 0.7)
            .await
            .unwrap();
        assert_eq!(reply, "Здравствуйте!");
    }
}

#[tokio::test]
async fn rejected_token_is_refreshed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/oauth"))
        .respond_with(token("tok-fresh"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(completion("ok"))
        .with_priority(2)
        .mount(&server)
        .await;

    let reply = backend(&server)
        .chat(&[ChatMessage::user("hi")], 0.2)
        .await
        .unwrap();
    assert_eq!(reply, "ok");
}

#[tokio::test]
async fn bad_credentials_fail_warmup_as_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/oauth"))
        .respond_with(
            ResponseTemplate::new(401).set_body_string("Authorization error: header is incorrect"),
        )
        .mount(&server)
        .await;

    let err = backend(&server).warmup().await.unwrap_err();
    assert!(err.to_string().contains("GigaChat auth error"));
    assert_eq!(classify_error(&err), ErrorClass::Fatal);
}

#[tokio::test]
async fn server_errors_classify_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/oauth"))
        .respond_with(token("tok-1"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = backend(&server)
        .chat(&[ChatMessage::user("hi")], 0.2)
        .await
        .unwrap_err();
    assert_eq!(classify_error(&err), ErrorClass::Transient);
}

#[tokio::test]
async fn registry_wires_config_into_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth"))
        .and(body_string("scope=GIGACHAT_API_CORP"))
        .respond_with(token("tok-corp"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "GigaChat-Pro", "max_tokens": 512})))
        .respond_with(completion("corp reply"))
        .expect(1)
        .mount(&server)
        .await;

    let config = LlmConfig {
        backend: "gigachat".into(),
        model: "GigaChat-Pro".into(),
        base_url: Some(format!("{}/api/v1", server.uri())),
        auth_url: Some(format!("{}/oauth", server.uri())),
        scope: Some("GIGACHAT_API_CORP".into()),
        api_key: Some(AUTH_KEY.into()),
        max_tokens: Some(512),
        ..LlmConfig::default()
    };
    let backend = BackendRegistry::with_builtin().create(&config).unwrap();
    let reply = backend.chat(&[ChatMessage::user("hi")], 0.2).await.unwrap();
    assert_eq!(reply, "corp reply");
}
