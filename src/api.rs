//! REST API server for the trip supervisor
//!
//! Exposes the session manager over HTTP for the interactive front-end.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::models::{ConfirmDecision, PreferenceField, UserInput};
use crate::supervisor::SessionManager;
use crate::Result;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub decision: ConfirmDecision,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EditRequest {
    pub preferences: BTreeMap<String, Value>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionManager>,
}

/// =============================
/// Helpers
/// =============================

/// Field names as the front-end sends them, aliases included
fn parse_fields(raw: BTreeMap<String, Value>) -> Result<BTreeMap<PreferenceField, Value>> {
    raw.into_iter()
        .map(|(name, value)| {
            PreferenceField::parse(&name)
                .map(|field| (field, value))
                .ok_or_else(|| {
                    SupervisorError::InvalidPreference(format!("unknown field '{}'", name))
                })
        })
        .collect()
}

fn parse_session_id(raw: &str) -> Result<Uuid> {
    Ok(Uuid::parse_str(raw.trim())?)
}

fn status_for(error: &SupervisorError) -> StatusCode {
    match error {
        SupervisorError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SupervisorError::InvalidPhase { .. } | SupervisorError::IllegalTransition { .. } => {
            StatusCode::CONFLICT
        }
        SupervisorError::InvalidPreference(_) | SupervisorError::UuidError(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T>) -> (StatusCode, Json<ApiResponse>) {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(error = %e, "request failed");
            }
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Session Endpoints
/// =============================

async fn create_session(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    let result = async move {
        let session_id = state.sessions.create_session().await?;
        let snapshot = state.sessions.snapshot(session_id).await?;
        Ok::<_, SupervisorError>(serde_json::json!({
            "session_id": session_id,
            "snapshot": snapshot,
        }))
    }
    .await;

    match &result {
        Ok(data) => info!(session_id = %data["session_id"], "session created via API"),
        Err(e) => warn!(error = %e, "failed to create session"),
    }
    respond(result)
}

async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        async move {
            let session_id = parse_session_id(&id)?;
            let snapshot = state.sessions.snapshot(session_id).await?;
            let missing = state.sessions.missing_preferences(session_id).await?;
            Ok::<_, SupervisorError>(serde_json::json!({
                "snapshot": snapshot,
                "missing_preferences": missing,
            }))
        }
        .await,
    )
}

async fn close_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        async move {
            let session_id = parse_session_id(&id)?;
            let snapshot = state.sessions.close_session(session_id).await?;
            Ok::<_, SupervisorError>(serde_json::json!({
                "closed": true,
                "snapshot": snapshot,
            }))
        }
        .await,
    )
}

async fn submit_input(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        async move {
            let session_id = parse_session_id(&id)?;
            let input = UserInput {
                message: req.message,
                preferences: parse_fields(req.preferences)?,
            };
            state.sessions.submit_input(session_id, &input).await
        }
        .await,
    )
}

async fn confirm_plan(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        async move {
            let session_id = parse_session_id(&id)?;
            state.sessions.confirm_plan(session_id, req.decision).await
        }
        .await,
    )
}

async fn edit_preferences(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<EditRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        async move {
            let session_id = parse_session_id(&id)?;
            let fields = parse_fields(req.preferences)?;
            state.sessions.edit_preferences(session_id, &fields).await
        }
        .await,
    )
}

async fn skip_step(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        async move {
            let session_id = parse_session_id(&id)?;
            state.sessions.skip_step(session_id).await
        }
        .await,
    )
}

async fn reset_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        async move {
            let session_id = parse_session_id(&id)?;
            state.sessions.request_reset(session_id).await
        }
        .await,
    )
}

async fn cancel_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        async move {
            let session_id = parse_session_id(&id)?;
            state.sessions.cancel(session_id).await?;
            Ok::<_, SupervisorError>(serde_json::json!({ "cancelled": true }))
        }
        .await,
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(sessions: Arc<SessionManager>) -> Router {
    let state = ApiState { sessions };

    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(close_session))
        .route("/api/sessions/:id/input", post(submit_input))
        .route("/api/sessions/:id/confirm", post(confirm_plan))
        .route("/api/sessions/:id/preferences", post(edit_preferences))
        .route("/api/sessions/:id/skip", post(skip_step))
        .route("/api/sessions/:id/reset", post(reset_session))
        .route("/api/sessions/:id/cancel", post(cancel_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    sessions: Arc<SessionManager>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(sessions);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::SupervisorConfig;
    use crate::handlers::create_default_registry;
    use crate::retry::Backoff;
    use crate::state::InMemorySessionStore;
    use crate::supervisor::Supervisor;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = SupervisorConfig::default().with_backoff(Backoff::none());
        let supervisor = Supervisor::new(create_default_registry(), config, AuditLog::new());
        let sessions = SessionManager::new(Arc::new(supervisor), Box::new(InMemorySessionStore::new()));
        create_router(Arc::new(sessions))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_session_flow() {
        let app = app();

        let (status, body) = call(&app, "POST", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        let id = body["data"]["session_id"].as_str().unwrap().to_string();

        let (_, body) = call(&app, "GET", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(
            body["data"]["missing_preferences"],
            serde_json::json!(["destination", "days", "budget"])
        );

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/input", id),
            Some(serde_json::json!({
                "message": "Busan for 3 days",
                "preferences": {
                    "destination": "Busan",
                    "duration": 3,
                    "budget": "medium",
                    "departure_date": "2026-11-02"
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["type"], "snapshot");
        assert_eq!(body["data"]["snapshot"]["phase"], "AWAITING_CONFIRMATION");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/confirm", id),
            Some(serde_json::json!({ "decision": "accept" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["snapshot"]["phase"], "DONE");
        assert_eq!(body["data"]["snapshot"]["calendar_status"]["status"], "SUCCEEDED");
        assert!(body["data"]["snapshot"]["calendar_status"]["detail"]
            .as_str()
            .unwrap()
            .starts_with("BEGIN:VCALENDAR"));

        let (status, body) = call(&app, "DELETE", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["closed"], true);
        assert_eq!(body["data"]["snapshot"]["phase"], "DONE");

        let (status, _) = call(&app, "GET", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = app();

        let (status, body) = call(&app, "GET", "/api/sessions/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let missing = format!("/api/sessions/{}", Uuid::new_v4());
        let (status, _) = call(&app, "GET", &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, "POST", "/api/sessions", None).await;
        let id = body["data"]["session_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/confirm", id),
            Some(serde_json::json!({ "decision": "revise" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("confirm_plan"));

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/preferences", id),
            Some(serde_json::json!({ "preferences": { "mood": "happy" } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
