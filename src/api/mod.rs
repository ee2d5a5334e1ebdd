// HTTP API routes (session authoring, lifecycle control, player actions)

mod play;
pub mod ws;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::db::{Database, Session};
use crate::engine::hub::SessionHub;
use crate::engine::lifecycle::{SessionStatus, SessionType, Transition};
use crate::engine::live::{
    CreateSessionRequest, LiveService, QuestionDetail, QuestionInput, UpdateSessionRequest,
};
use crate::engine::registration::RegistrationField;
use crate::error::GameError;
use crate::metrics;
use crate::rate_limit::{RateLimitError, RateLimitType, RateLimiter};

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SetTeamsRequest {
    pub teams: Vec<String>,
}

#[derive(Deserialize)]
pub struct SetMapRequest {
    pub rows: i64,
    pub cols: i64,
}

/// One row of an admin's session list.
#[derive(Serialize)]
struct SessionListItem {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    kind: SessionType,
    status: SessionStatus,
    pin: String,
    created_at: String,
}

impl From<&Session> for SessionListItem {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            kind: s.kind(),
            status: s.status(),
            pin: s.pin.clone(),
            created_at: s.created_at.clone(),
        }
    }
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub live: Arc<LiveService>,
    pub hub: Arc<SessionHub>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(db: Arc<Database>, hub: Arc<SessionHub>, rate_limiter: RateLimiter) -> Self {
        let live = Arc::new(LiveService::new(db.clone(), hub.clone()));
        Self {
            db,
            live,
            hub,
            rate_limiter,
        }
    }
}

// ── Error helpers ─────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn rate_limited(e: RateLimitError) -> impl IntoResponse {
    json_error(StatusCode::TOO_MANY_REQUESTS, &e.to_string())
}

impl IntoResponse for GameError {
    fn into_response(self) -> Response {
        let status = match &self {
            GameError::InvalidSessionState { .. }
            | GameError::DuplicateAnswer
            | GameError::TerritoryAlreadyClaimed
            | GameError::ClaimNotEarned => StatusCode::CONFLICT,
            GameError::AnswerWindowClosed => StatusCode::GONE,
            GameError::ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GameError::SessionNotFound
            | GameError::PlayerNotFound
            | GameError::QuestionNotFound
            | GameError::TerritoryNotFound => StatusCode::NOT_FOUND,
            GameError::Forbidden => StatusCode::FORBIDDEN,
            GameError::Storage(e) => {
                tracing::error!("Database error: {e}");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": "Storage temporarily unavailable",
                        "code": self.code(),
                    })),
                )
                    .into_response();
            }
        };
        let mut body = json!({ "error": self.to_string(), "code": self.code() });
        if let GameError::ValidationFailed { field, .. } = &self {
            body["field"] = json!(field);
        }
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        // Sessions (admin)
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route(
            "/api/sessions/{id}/questions",
            get(get_questions).put(set_questions),
        )
        .route("/api/sessions/{id}/fields", put(set_fields))
        .route("/api/sessions/{id}/teams", put(set_teams))
        .route("/api/sessions/{id}/map", put(set_map))
        // Lifecycle
        .route("/api/sessions/{id}/ready", post(mark_ready))
        .route("/api/sessions/{id}/draft", post(back_to_draft))
        .route("/api/sessions/{id}/launch", post(launch_session))
        .route("/api/sessions/{id}/end", post(end_session))
        .route("/api/sessions/{id}/history", get(session_history))
        // Players
        .route("/api/play/{pin}", get(play::session_status))
        .route("/api/play/{pin}/validate", post(play::validate_join))
        .route("/api/play/{pin}/join", post(play::join))
        .route("/api/play/{pin}/leaderboard", get(play::leaderboard))
        .route("/api/play/{pin}/territories", get(play::territories))
        .route("/api/players/{token}", get(play::player_state))
        .route("/api/players/{token}/question", get(play::next_question))
        .route("/api/players/{token}/answers", post(play::submit_answer))
        .route("/api/players/{token}/claims", post(play::claim_territory))
        // Observability and documentation
        .route("/metrics", get(get_metrics))
        .route("/llms.txt", get(get_llms_txt))
        // WebSocket
        .route("/ws/sessions/{pin}", get(ws::ws_session))
        .with_state(state)
}

// ── Session handlers ──────────────────────────────────────────────────

async fn list_sessions(State(state): State<AppState>, auth: AuthUser) -> impl IntoResponse {
    match state.db.list_sessions(auth.0.sub).await {
        Ok(sessions) => {
            let items: Vec<SessionListItem> = sessions.iter().map(SessionListItem::from).collect();
            (StatusCode::OK, Json(json!(items))).into_response()
        }
        Err(e) => GameError::from(e).into_response(),
    }
}

async fn create_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    if let Err(e) = state
        .rate_limiter
        .check_limit(auth.0.sub, RateLimitType::SessionCreates)
    {
        return rate_limited(e).into_response();
    }
    let session = match state.live.create_session(auth.0.sub, req).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.session_detail(&session).await {
        Ok(detail) => (StatusCode::CREATED, Json(json!(detail))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let session = match state.live.owned_session(auth.0.sub, id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.session_detail(&session).await {
        Ok(detail) => (StatusCode::OK, Json(json!(detail))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn update_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSessionRequest>,
) -> impl IntoResponse {
    let session = match state.live.owned_session(auth.0.sub, id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    let updated = match state.live.update_session(&session, req).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.session_detail(&updated).await {
        Ok(detail) => (StatusCode::OK, Json(json!(detail))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let session = match state.live.owned_session(auth.0.sub, id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.delete_session(&session).await {
        Ok(()) => {
            state.rate_limiter.forget(id, RateLimitType::JoinAttempts);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn get_questions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(e) = state.live.owned_session(auth.0.sub, id).await {
        return e.into_response();
    }
    match state.db.list_questions(id).await {
        Ok(questions) => {
            let questions: Vec<QuestionDetail> = questions.iter().map(QuestionDetail::from).collect();
            (StatusCode::OK, Json(json!(questions))).into_response()
        }
        Err(e) => GameError::from(e).into_response(),
    }
}

async fn set_questions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<Vec<QuestionInput>>,
) -> impl IntoResponse {
    let session = match state.live.owned_session(auth.0.sub, id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.set_questions(&session, &req).await {
        Ok(questions) => {
            let questions: Vec<QuestionDetail> = questions.iter().map(QuestionDetail::from).collect();
            (StatusCode::OK, Json(json!(questions))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn set_fields(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<Vec<RegistrationField>>,
) -> impl IntoResponse {
    let session = match state.live.owned_session(auth.0.sub, id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.set_fields(&session, &req).await {
        Ok(fields) => (StatusCode::OK, Json(json!(fields))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn set_teams(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<SetTeamsRequest>,
) -> impl IntoResponse {
    let session = match state.live.owned_session(auth.0.sub, id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.set_teams(&session, &req.teams).await {
        Ok(teams) => (StatusCode::OK, Json(json!(teams))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn set_map(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<SetMapRequest>,
) -> impl IntoResponse {
    let session = match state.live.owned_session(auth.0.sub, id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.set_map(&session, req.rows, req.cols).await {
        Ok(territories) => (StatusCode::OK, Json(json!(territories))).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Lifecycle handlers ────────────────────────────────────────────────

async fn apply_transition(
    state: &AppState,
    auth: &AuthUser,
    id: i64,
    transition: Transition,
) -> Response {
    if let Err(e) = state.live.owned_session(auth.0.sub, id).await {
        return e.into_response();
    }
    let session = match state.live.transition(id, transition).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.session_detail(&session).await {
        Ok(detail) => (StatusCode::OK, Json(json!(detail))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn mark_ready(State(state): State<AppState>, auth: AuthUser, Path(id): Path<i64>) -> Response {
    apply_transition(&state, &auth, id, Transition::MarkReady).await
}

async fn back_to_draft(State(state): State<AppState>, auth: AuthUser, Path(id): Path<i64>) -> Response {
    apply_transition(&state, &auth, id, Transition::BackToDraft).await
}

async fn launch_session(State(state): State<AppState>, auth: AuthUser, Path(id): Path<i64>) -> Response {
    apply_transition(&state, &auth, id, Transition::Launch).await
}

async fn end_session(State(state): State<AppState>, auth: AuthUser, Path(id): Path<i64>) -> Response {
    apply_transition(&state, &auth, id, Transition::End).await
}

async fn session_history(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let session = match state.live.owned_session(auth.0.sub, id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.session_results(&session).await {
        Ok(results) => (StatusCode::OK, Json(json!(results))).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Observability and documentation ───────────────────────────────────

async fn get_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn get_llms_txt() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        crate::llms_txt::LLMS_TXT,
    )
        .into_response()
}

/// Record request count and latency per normalized route.
pub async fn track_requests(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let started = std::time::Instant::now();
    let response = next.run(req).await;
    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.as_str()])
        .observe(started.elapsed().as_secs_f64());
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    response
}
