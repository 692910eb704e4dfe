use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};

use crate::server::{
    auth::authenticate,
    core::AppState,
    db::ensure_db_schema,
    domain::{list_notifications, mark_notification_read},
    errors::ApiFailure,
    types::{NotificationListQuery, NotificationListResponse, NotificationResponse},
};

pub(crate) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NotificationListQuery>,
) -> Result<Json<NotificationListResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let notifications = list_notifications(
        &state,
        &auth,
        query.limit,
        query.unread_only.unwrap_or(false),
    )
    .await?;
    Ok(Json(NotificationListResponse { notifications }))
}

pub(crate) async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(notification_id): Path<String>,
) -> Result<Json<NotificationResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let notification = mark_notification_read(&state, &auth, &notification_id).await?;
    Ok(Json(notification))
}
