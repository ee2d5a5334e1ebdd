// Player-facing handlers: join by PIN, answer questions, claim territory.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use super::{rate_limited, AppState};
use crate::engine::live::{ClaimRequest, SubmitAnswer};
use crate::engine::registration::JoinRequest;
use crate::rate_limit::RateLimitType;

pub(super) async fn session_status(
    State(state): State<AppState>,
    Path(pin): Path<String>,
) -> impl IntoResponse {
    match state.live.session_summary(&pin).await {
        Ok(summary) => (StatusCode::OK, Json(json!(summary))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn validate_join(
    State(state): State<AppState>,
    Path(pin): Path<String>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    match state.live.validate_join(&pin, &req).await {
        Ok(payload) => (StatusCode::OK, Json(json!({ "valid": true, "payload": payload }))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn join(
    State(state): State<AppState>,
    Path(pin): Path<String>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    let session = match state.live.session_by_pin(&pin).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = state
        .rate_limiter
        .check_limit(session.id, RateLimitType::JoinAttempts)
    {
        return rate_limited(e).into_response();
    }
    match state.live.join(&pin, &req).await {
        Ok(joined) => (StatusCode::CREATED, Json(json!(joined))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn leaderboard(
    State(state): State<AppState>,
    Path(pin): Path<String>,
) -> impl IntoResponse {
    let session = match state.live.session_by_pin(&pin).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.live.leaderboard(session.id).await {
        Ok(view) => (StatusCode::OK, Json(json!(view))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn territories(
    State(state): State<AppState>,
    Path(pin): Path<String>,
) -> impl IntoResponse {
    match state.live.territories(&pin).await {
        Ok(territories) => (StatusCode::OK, Json(json!(territories))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn player_state(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.live.player_state(&token).await {
        Ok(player) => (StatusCode::OK, Json(json!(player))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn next_question(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.live.next_question(&token).await {
        Ok(next) => (StatusCode::OK, Json(json!(next))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn submit_answer(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<SubmitAnswer>,
) -> impl IntoResponse {
    match state.live.submit_answer(&token, &req).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn claim_territory(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> impl IntoResponse {
    match state.live.claim_territory(&token, &req).await {
        Ok(outcome) => (StatusCode::CREATED, Json(json!(outcome))).into_response(),
        Err(e) => e.into_response(),
    }
}
