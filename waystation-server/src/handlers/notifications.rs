//! Notification routes. The SSE stream lives in [`crate::sse`].

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use waystation_core::types::Notification;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Json<Vec<Notification>>> {
    Ok(Json(state.db.list_notifications(
        query.offset,
        query.limit.min(200),
    )?))
}

#[derive(Serialize)]
pub struct UnreadCount {
    pub count: i64,
}

pub async fn unread_count(State(state): State<AppState>) -> ApiResult<Json<UnreadCount>> {
    Ok(Json(UnreadCount {
        count: state.db.unread_notification_count()?,
    }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.db.mark_notification_read(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_read(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.db.mark_all_notifications_read()?;
    Ok(StatusCode::NO_CONTENT)
}
