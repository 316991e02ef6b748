//! Integration tests for the translation sync service
//!
//! These tests exercise the full webhook pipeline over HTTP: a spawned axum
//! server, a wiremock translation provider, and a temporary CMS database.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

use cms_translation_sync::config::{CollectionConfig, Config, LocaleSpec};
use cms_translation_sync::orchestrator::SyncOrchestrator;
use cms_translation_sync::provider::HttpTranslationProvider;
use cms_translation_sync::registry::LanguageRegistry;
use cms_translation_sync::retry::RetryConfig;
use cms_translation_sync::server::{router, AppState};
use cms_translation_sync::store::Store;

// ==================== Test Helpers ====================

fn locale(code: &str, name: &str) -> LocaleSpec {
    LocaleSpec {
        code: code.to_string(),
        name: name.to_string(),
        direction: "ltr".to_string(),
    }
}

fn map_locations() -> CollectionConfig {
    CollectionConfig {
        name: "map_locations".to_string(),
        id_field: "id".to_string(),
        translatable_fields: vec!["name".to_string(), "description".to_string()],
    }
}

/// Create a test config pointing at a mocked provider and a temp database
fn create_test_config(provider_url: &str, temp_dir: &TempDir) -> Config {
    Config {
        database_path: temp_dir
            .path()
            .join("cms.db")
            .to_str()
            .unwrap()
            .to_string(),
        port: 0,
        provider_url: provider_url.to_string(),
        provider_api_key: None,
        provider_timeout_secs: 5,
        provider_max_attempts: 2,
        source_locale: "id-ID".to_string(),
        locales: vec![locale("id-ID", "Indonesian"), locale("en-US", "English")],
        collections: vec![map_locations()],
        service_policy_id: "translation-sync".to_string(),
    }
}

/// Wire the app the way main does and serve it on an ephemeral port.
/// Returns the base URL and the store for direct assertions.
async fn spawn_app(config: Config) -> (String, Store) {
    let store = Store::new(&config.database_path).expect("Should open store");
    store
        .init_schema(&config.collections)
        .expect("Should init schema");
    store
        .ensure_languages(&config.locales)
        .expect("Should provision languages");

    let registry = Arc::new(LanguageRegistry::new(
        store.list_languages().expect("Should load registry"),
    ));

    let provider = Arc::new(HttpTranslationProvider::new(
        reqwest::Client::new(),
        &config.provider_url,
        config.provider_api_key.clone(),
        RetryConfig::new(config.provider_max_attempts, Duration::from_millis(10)),
    ));

    let orchestrator = Arc::new(SyncOrchestrator::new(
        config,
        registry,
        store.clone(),
        provider,
    ));

    let app = router(AppState { orchestrator });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Should bind");
    let addr = listener.local_addr().expect("Should have an address");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    (format!("http://{}", addr), store)
}

/// Responder that "translates" by appending the target language to the text.
struct EchoTranslator;

impl Respond for EchoTranslator {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value =
            serde_json::from_slice(&request.body).expect("Provider request should be JSON");
        let q = body["q"].as_str().unwrap_or_default();
        let target = body["target"].as_str().unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({
            "translatedText": format!("{} ({})", q, target)
        }))
    }
}

async fn mock_echo_provider() -> MockServer {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/translate"))
        .respond_with(EchoTranslator)
        .mount(&mock_server)
        .await;
    mock_server
}

fn update_body() -> serde_json::Value {
    json!({
        "collection": "map_locations",
        "key": 1,
        "event": "items.update",
        "payload": {
            "name": "Candi Borobudur",
            "description": "Candi Buddha terbesar di dunia",
            "latitude": -7.6079
        }
    })
}

// ==================== End-to-End Scenario ====================

#[tokio::test]
async fn test_update_creates_translated_row_for_target_locale_only() {
    let provider = mock_echo_provider().await;
    let temp = TempDir::new().unwrap();
    let config = create_test_config(&provider.uri(), &temp);
    let (base_url, store) = spawn_app(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/webhook/auto-translate", base_url))
        .json(&update_body())
        .send()
        .await
        .expect("Should reach server");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Should be JSON");
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["translated"], json!(["en-US"]));

    let rows = store.translations_for(&map_locations(), "1").unwrap();
    assert_eq!(rows.len(), 1, "Exactly one row, none for the source locale");
    assert_eq!(rows[0].language_code, "en-US");
    assert_eq!(rows[0].fields["name"], json!("Candi Borobudur (en)"));
    assert_eq!(
        rows[0].fields["description"],
        json!("Candi Buddha terbesar di dunia (en)")
    );
    assert!(!rows[0].degraded);
}

#[tokio::test]
async fn test_replaying_the_same_webhook_is_idempotent() {
    let provider = mock_echo_provider().await;
    let temp = TempDir::new().unwrap();
    let config = create_test_config(&provider.uri(), &temp);
    let (base_url, store) = spawn_app(config).await;

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let response = client
            .post(format!("{}/webhook/auto-translate", base_url))
            .json(&update_body())
            .send()
            .await
            .expect("Should reach server");
        assert!(response.status().is_success());
    }

    let rows = store.translations_for(&map_locations(), "1").unwrap();
    assert_eq!(rows.len(), 1, "Redelivery must not duplicate rows");
}

#[tokio::test]
async fn test_update_replaces_previous_translation() {
    let provider = mock_echo_provider().await;
    let temp = TempDir::new().unwrap();
    let config = create_test_config(&provider.uri(), &temp);
    let (base_url, store) = spawn_app(config).await;

    let client = reqwest::Client::new();
    client
        .post(format!("{}/webhook/auto-translate", base_url))
        .json(&update_body())
        .send()
        .await
        .expect("Should reach server");

    let mut second = update_body();
    second["payload"]["name"] = json!("Candi Prambanan");
    client
        .post(format!("{}/webhook/auto-translate", base_url))
        .json(&second)
        .send()
        .await
        .expect("Should reach server");

    let rows = store.translations_for(&map_locations(), "1").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields["name"], json!("Candi Prambanan (en)"));
}

// ==================== Degraded Fallback ====================

#[tokio::test]
async fn test_provider_failure_degrades_to_source_text() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/translate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let config = create_test_config(&mock_server.uri(), &temp);
    let (base_url, store) = spawn_app(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/webhook/auto-translate", base_url))
        .json(&update_body())
        .send()
        .await
        .expect("Should reach server");

    // Degraded persistence still counts as success
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Should be JSON");
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["translated"], json!(["en-US"]));

    let rows = store.translations_for(&map_locations(), "1").unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].degraded, "Row must be flagged for reconciliation");
    assert_eq!(rows[0].fields["name"], json!("Candi Borobudur"));
}

// ==================== Delete Scenario ====================

#[tokio::test]
async fn test_delete_removes_rows_and_redelivery_is_noop() {
    let provider = mock_echo_provider().await;
    let temp = TempDir::new().unwrap();
    let config = create_test_config(&provider.uri(), &temp);
    let (base_url, store) = spawn_app(config).await;

    let client = reqwest::Client::new();
    client
        .post(format!("{}/webhook/auto-translate", base_url))
        .json(&update_body())
        .send()
        .await
        .expect("Should reach server");
    assert_eq!(store.translations_for(&map_locations(), "1").unwrap().len(), 1);

    let delete_body = json!({
        "collection": "map_locations",
        "key": 1,
        "event": "items.delete"
    });

    for _ in 0..2 {
        let response = client
            .post(format!("{}/webhook/auto-translate", base_url))
            .json(&delete_body)
            .send()
            .await
            .expect("Should reach server");
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.expect("Should be JSON");
        assert_eq!(body["success"], json!(true));
    }

    assert!(store.translations_for(&map_locations(), "1").unwrap().is_empty());
}

// ==================== Validation ====================

#[tokio::test]
async fn test_malformed_notifications_are_rejected_without_side_effects() {
    let provider = mock_echo_provider().await;
    let temp = TempDir::new().unwrap();
    let config = create_test_config(&provider.uri(), &temp);
    let (base_url, store) = spawn_app(config).await;

    let client = reqwest::Client::new();
    let bad_bodies = [
        json!({"key": 1, "event": "items.update", "payload": {}}),
        json!({"collection": "map_locations", "event": "items.update", "payload": {}}),
        json!({"collection": "map_locations", "key": 1, "event": "items.promote"}),
        json!({"collection": "unknown_collection", "key": 1, "event": "items.update", "payload": {"name": "x"}}),
    ];

    for body in &bad_bodies {
        let response = client
            .post(format!("{}/webhook/auto-translate", base_url))
            .json(body)
            .send()
            .await
            .expect("Should reach server");

        assert_eq!(
            response.status(),
            reqwest::StatusCode::BAD_REQUEST,
            "Body should be rejected: {}",
            body
        );
        let parsed: serde_json::Value = response.json().await.expect("Should be JSON");
        assert_eq!(parsed["success"], json!(false));
        assert!(parsed["error"].is_string());
    }

    // No webhook produced any rows
    assert!(store.translations_for(&map_locations(), "1").unwrap().is_empty());
    assert_eq!(provider.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_invalid_json_body_is_rejected() {
    let provider = mock_echo_provider().await;
    let temp = TempDir::new().unwrap();
    let config = create_test_config(&provider.uri(), &temp);
    let (base_url, _store) = spawn_app(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/webhook/auto-translate", base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("Should reach server");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let parsed: serde_json::Value = response.json().await.expect("Should be JSON");
    assert_eq!(parsed["success"], json!(false));
}

// ==================== Health ====================

#[tokio::test]
async fn test_health_endpoint() {
    let provider = mock_echo_provider().await;
    let temp = TempDir::new().unwrap();
    let config = create_test_config(&provider.uri(), &temp);
    let (base_url, _store) = spawn_app(config).await;

    let response = reqwest::Client::new()
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Should reach server");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Should be JSON");
    assert_eq!(body["status"], json!("ok"));
}
