use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::server::{
    auth::authenticate,
    core::AppState,
    db::ensure_db_schema,
    domain::{append_message, list_messages, mark_room_read},
    errors::ApiFailure,
    types::{
        CreateMessageRequest, MessageHistoryQuery, MessageListResponse, MessageResponse,
        RoomReadResponse,
    },
};

pub(crate) async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Json(payload): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let message = append_message(&state, &auth, &room_id, &payload.content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub(crate) async fn get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Query(query): Query<MessageHistoryQuery>,
) -> Result<Json<MessageListResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let messages = list_messages(
        &state,
        &auth,
        &room_id,
        query.limit,
        query.before.as_deref(),
    )
    .await?;
    Ok(Json(MessageListResponse { messages }))
}

pub(crate) async fn read_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomReadResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let unread_count = mark_room_read(&state, &auth, &room_id).await?;
    Ok(Json(RoomReadResponse {
        room_id,
        unread_count,
    }))
}
