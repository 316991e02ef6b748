use crate::error::SyncError;
use crate::orchestrator::{ChangeNotification, EventType, SyncOrchestrator};
use axum::{
    extract::rejection::JsonRejection,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
}

/// Response body for the webhook endpoint.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResponse {
    fn ok(translated: Vec<String>) -> Self {
        Self {
            success: true,
            translated: Some(translated),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            translated: None,
            error: Some(message.into()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/auto-translate", post(handle_webhook))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the task is cancelled.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_webhook(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<WebhookResponse>) {
    let Ok(Json(body)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(WebhookResponse::err("request body is not valid JSON")),
        );
    };

    let notification = match parse_notification(&body) {
        Ok(notification) => notification,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(WebhookResponse::err(message)));
        }
    };

    match state.orchestrator.handle(&notification).await {
        Ok(outcome) => {
            let translated = outcome
                .persisted_locales()
                .into_iter()
                .map(str::to_string)
                .collect();
            (StatusCode::OK, Json(WebhookResponse::ok(translated)))
        }
        Err(SyncError::Validation(message)) => {
            (StatusCode::BAD_REQUEST, Json(WebhookResponse::err(message)))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WebhookResponse::err(e.to_string())),
        ),
    }
}

/// Validate the raw webhook body. Unknown events, missing keys, and
/// non-object payloads are rejected before any side effect can happen.
fn parse_notification(body: &Value) -> Result<ChangeNotification, String> {
    let Some(object) = body.as_object() else {
        return Err("request body must be a JSON object".to_string());
    };

    let collection = object
        .get("collection")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or("'collection' is required")?
        .to_string();

    let event = object
        .get("event")
        .and_then(Value::as_str)
        .ok_or("'event' is required")?;
    let event = EventType::parse(event)
        .ok_or_else(|| format!("unrecognized event '{}'", event))?;

    let key = match object.get("key") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return Err("'key' must be a string or number".to_string()),
        None => return Err("'key' is required".to_string()),
    };

    // Payload is ignored for deletes; for create/update an absent payload
    // means there is nothing to translate.
    let payload: Map<String, Value> = if event == EventType::Delete {
        Map::new()
    } else {
        match object.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err("'payload' must be an object".to_string()),
        }
    };

    Ok(ChangeNotification {
        collection,
        key,
        event,
        payload,
    })
}
