use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::server::{
    auth::authenticate,
    core::AppState,
    db::ensure_db_schema,
    domain::{block_user, effective_presence, list_blocks, set_online_status, unblock_user},
    errors::ApiFailure,
    types::{BlockListResponse, PresenceResponse, UpdateStatusRequest},
};

pub(crate) async fn update_my_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<StatusCode, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    set_online_status(&state, &auth, payload.is_online).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn get_user_presence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let _auth = authenticate(&state, &headers).await?;
    let online = effective_presence(&state, &user_id).await?;
    Ok(Json(PresenceResponse { user_id, online }))
}

pub(crate) async fn create_block(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    block_user(&state, &auth, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn delete_block(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    unblock_user(&state, &auth, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn list_my_blocks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BlockListResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let blocked_user_ids = list_blocks(&state, &auth).await?;
    Ok(Json(BlockListResponse { blocked_user_ids }))
}
