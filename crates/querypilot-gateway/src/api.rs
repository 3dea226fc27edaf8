use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use querypilot_agent::QueryRequest;
use querypilot_common::Error;
use querypilot_connect::{Endpoint, EndpointKind};
use querypilot_memory::Feedback;

use crate::state::SharedState;

/// The outer layer attaches the verified user identity on this header;
/// absence falls back to the anonymous user for local playground use.
const USER_HEADER: &str = "x-user-id";

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// `{message: "<ErrorKind>: <detail>"}` with the HTTP status the kind
/// implies.
fn error_response(error: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match error {
        Error::BadInput(_) | Error::UnsupportedEndpoint(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized(_) => StatusCode::FORBIDDEN,
        Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
        Error::ConnectionFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "message": error.to_string() })),
    )
}

/// POST /api/query — one stateless agent turn.
pub async fn query(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> impl IntoResponse {
    let user = user_id(&headers);

    let endpoint = match resolve_endpoint(&request) {
        Ok(endpoint) => endpoint,
        Err(e) => return error_response(&e).into_response(),
    };

    match state.pipeline.handle_turn(&user, &request, &endpoint).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            warn!("query turn failed for {user}: {e}");
            error_response(&e).into_response()
        }
    }
}

fn resolve_endpoint(request: &QueryRequest) -> Result<Endpoint, Error> {
    let url = request
        .db_url
        .as_deref()
        .ok_or_else(|| Error::BadInput("dbUrl is required".to_string()))?;
    let kind = request.db_type.as_deref().and_then(EndpointKind::from_str);
    Endpoint::new(url, kind)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub query_id: String,
    pub feedback: String,
}

/// POST /api/feedback — attach +/- feedback to a prior turn's record.
pub async fn feedback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<FeedbackRequest>,
) -> impl IntoResponse {
    let user = user_id(&headers);

    let Some(feedback) = Feedback::from_db(&request.feedback) else {
        let error = Error::BadInput("feedback must be positive or negative".to_string());
        return error_response(&error).into_response();
    };

    match state.meta.set_feedback(&request.query_id, &user, feedback) {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true })),
        )
            .into_response(),
        Ok(false) => {
            let error = Error::SessionNotFound(format!("query {}", request.query_id));
            error_response(&error).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

/// GET /api/status — capability listing.
pub async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "running",
        "databases": ["document", "postgres", "mysql"],
        "capabilities": [
            "natural_language_queries",
            "schema_detection",
            "safety_guardrails",
            "dry_run_preview",
            "conversation_sessions",
            "personalized_memory",
        ],
        "sessions": state.live.len(),
    }))
}
