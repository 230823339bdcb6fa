use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use mingle_shared::errors::{AppError, AppResult, ErrorCode};
use mingle_shared::types::api::ApiResponse;

use crate::models::{Like, Profile};
use crate::registry::{ListenerError, ListenerStatus, Topic};
use crate::session::ListenerState;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LikePayload {
    pub target_session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PresencePayload {
    pub foreground: bool,
}

#[derive(Debug, Serialize)]
pub struct LikedResponse {
    pub liked: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub event_id: String,
    pub active: bool,
    pub profile: Option<Profile>,
    pub unseen_messages: usize,
    pub incoming_likes: usize,
    pub listeners: Vec<ListenerState>,
}

// ---------------------------------------------------------------------------
// GET /session
// ---------------------------------------------------------------------------

pub async fn get_session(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SessionView>> {
    let session = &state.session;
    Json(ApiResponse::ok(SessionView {
        session_id: session.session_id().to_string(),
        event_id: session.event_id().to_string(),
        active: session.is_active(),
        profile: session.own_profile(),
        unseen_messages: session.unseen_count(),
        incoming_likes: session.incoming_count(),
        listeners: session.listener_status(),
    }))
}

// ---------------------------------------------------------------------------
// POST /session
// ---------------------------------------------------------------------------

/// Start the session, or start it again after `POST /logout`.
pub async fn start_session(State(state): State<Arc<AppState>>) -> AppResult<Json<ApiResponse<Profile>>> {
    let profile = state.session.start().await?;
    Ok(Json(ApiResponse::ok_with_message(profile, "session started")))
}

// ---------------------------------------------------------------------------
// POST /likes
// ---------------------------------------------------------------------------

pub async fn create_like(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LikePayload>,
) -> AppResult<Json<ApiResponse<Like>>> {
    if payload.target_session_id.trim().is_empty() {
        return Err(AppError::bad_request("target_session_id is required"));
    }
    let like = state.session.like(&payload.target_session_id).await?;
    Ok(Json(ApiResponse::ok(like)))
}

// ---------------------------------------------------------------------------
// GET /likes
// ---------------------------------------------------------------------------

pub async fn get_liked(State(state): State<Arc<AppState>>) -> Json<ApiResponse<LikedResponse>> {
    Json(ApiResponse::ok(LikedResponse {
        liked: state.session.liked(),
    }))
}

// ---------------------------------------------------------------------------
// GET /peers
// ---------------------------------------------------------------------------

pub async fn get_peers(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Profile>>> {
    Json(ApiResponse::ok(state.session.peers()))
}

// ---------------------------------------------------------------------------
// POST /alerts/:pair_id/dismiss
// ---------------------------------------------------------------------------

pub async fn dismiss_alert(
    State(state): State<Arc<AppState>>,
    Path(pair_id): Path<String>,
) -> AppResult<Json<ApiResponse<()>>> {
    if !state.session.dismiss_alert(&pair_id) {
        return Err(AppError::new(
            ErrorCode::AlertNotFound,
            format!("no active alert for {pair_id}"),
        ));
    }
    Ok(Json(ApiResponse::ok_with_message((), "alert dismissed")))
}

// ---------------------------------------------------------------------------
// PUT /presence
// ---------------------------------------------------------------------------

pub async fn set_presence(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PresencePayload>,
) -> Json<ApiResponse<()>> {
    state.session.set_foreground(payload.foreground);
    Json(ApiResponse::ok(()))
}

// ---------------------------------------------------------------------------
// POST /listeners/:topic/retry
// ---------------------------------------------------------------------------

pub async fn retry_listener(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> AppResult<Json<ApiResponse<ListenerStatus>>> {
    let topic = Topic::parse(&topic).ok_or(ListenerError::UnknownTopic(topic))?;
    let status = state.session.retry_listener(topic)?;
    Ok(Json(ApiResponse::ok(status)))
}

// ---------------------------------------------------------------------------
// POST /recheck
// ---------------------------------------------------------------------------

pub async fn recheck(State(state): State<Arc<AppState>>) -> Json<ApiResponse<usize>> {
    Json(ApiResponse::ok(state.session.recheck().await))
}

// ---------------------------------------------------------------------------
// POST /logout
// ---------------------------------------------------------------------------

/// Ends the session until the next `POST /session`.
pub async fn logout(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    state.session.logout();
    Json(ApiResponse::ok_with_message((), "logged out"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_errors_map_to_codes() {
        let err: AppError = ListenerError::UnknownTopic("nope".into()).into();
        assert_eq!(err.error_code(), ErrorCode::UnknownListener);
        let err: AppError = ListenerError::NotActive(Topic::PeerProfiles).into();
        assert_eq!(err.error_code(), ErrorCode::ListenerDenied);
    }
}
