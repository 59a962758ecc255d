//! # Room Endpoints
//!
//! - `POST /api/v1/rooms`: reserve a fresh room code
//! - `GET /api/v1/rooms/{code}`: does the room exist, and where was it found
//!
//! A reserved room is registered in-process with no host, so the code cannot be
//! handed out twice before its host connects.

use crate::error::{AppError, AppResult};
use crate::rooms::is_valid_code;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub room_code: String,
}

/// Where a room was found by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomSource {
    Memory,
    Store,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub room_code: String,
    pub exists: bool,
    pub source: Option<RoomSource>,
}

pub async fn create_room(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let room_code = state
        .hub
        .generate_room_code(&state.durable, state.config.rooms.code_attempts)
        .await?;
    info!(room_code = %room_code, "Room reserved");

    Ok(HttpResponse::Created().json(RoomCreated { room_code }))
}

/// Consults the in-process registry first, then the durable store.
pub async fn check_room(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let code = path.into_inner();
    if !is_valid_code(&code) {
        return Err(AppError::ValidationError(format!(
            "Room code must be exactly 5 digits, got '{}'",
            code
        )));
    }

    let in_memory = state.hub.lock().room_exists(&code);
    let source = if in_memory {
        Some(RoomSource::Memory)
    } else if state.durable.exists(&code).await {
        Some(RoomSource::Store)
    } else {
        None
    };

    Ok(HttpResponse::Ok().json(RoomStatus {
        room_code: code,
        exists: source.is_some(),
        source,
    }))
}
