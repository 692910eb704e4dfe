use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::server::{
    auth::authenticate,
    core::AppState,
    db::ensure_db_schema,
    domain::{create_direct_room, create_group_room, list_rooms_for_user},
    errors::ApiFailure,
    types::{CreateDirectRoomRequest, CreateGroupRoomRequest, RoomListResponse, RoomResponse},
};

pub(crate) async fn create_direct(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateDirectRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let (room, created) = create_direct_room(&state, &auth, &payload.user_id).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(room)))
}

pub(crate) async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateGroupRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let room = create_group_room(&state, &auth, &payload.name, &payload.member_ids).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub(crate) async fn list_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RoomListResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let rooms = list_rooms_for_user(&state, &auth).await?;
    Ok(Json(RoomListResponse { rooms }))
}
