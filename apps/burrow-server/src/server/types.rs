use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{core::METRICS_TEXT_CONTENT_TYPE, metrics::render_metrics};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RegisterRequest {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterResponse {
    pub(crate) accepted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RefreshRequest {
    pub(crate) refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AuthResponse {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) expires_in_secs: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MeResponse {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) is_online: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateStatusRequest {
    pub(crate) is_online: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct PresenceResponse {
    pub(crate) user_id: String,
    pub(crate) online: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct BlockListResponse {
    pub(crate) blocked_user_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateDirectRoomRequest {
    pub(crate) user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateGroupRoomRequest {
    pub(crate) name: String,
    pub(crate) member_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RoomMemberResponse {
    pub(crate) user_id: String,
    pub(crate) joined_at_unix: i64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RoomResponse {
    pub(crate) room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    pub(crate) is_group: bool,
    pub(crate) created_by_user_id: String,
    pub(crate) members: Vec<RoomMemberResponse>,
    pub(crate) unread_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_message_id: Option<String>,
    pub(crate) created_at_unix: i64,
    pub(crate) updated_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomListResponse {
    pub(crate) rooms: Vec<RoomResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateMessageRequest {
    pub(crate) content: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MessageResponse {
    pub(crate) message_id: String,
    pub(crate) room_id: String,
    pub(crate) sender_id: String,
    pub(crate) sender_username: String,
    pub(crate) content: String,
    pub(crate) read_by: Vec<String>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageListResponse {
    pub(crate) messages: Vec<MessageResponse>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageHistoryQuery {
    pub(crate) limit: Option<usize>,
    pub(crate) before: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomReadResponse {
    pub(crate) room_id: String,
    pub(crate) unread_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct NotificationResponse {
    pub(crate) notification_id: String,
    pub(crate) kind: burrow_core::NotificationKind,
    pub(crate) room_id: String,
    pub(crate) actor_user_id: String,
    pub(crate) read: bool,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct NotificationListResponse {
    pub(crate) notifications: Vec<NotificationResponse>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotificationListQuery {
    pub(crate) limit: Option<usize>,
    pub(crate) unread_only: Option<bool>,
}

/// Token sources accepted by the gateway upgrade, checked in order:
/// the `auth` field, then `access_token`, then the Authorization header.
#[derive(Debug, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    pub(crate) auth: Option<String>,
    pub(crate) access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayRoomCommand {
    pub(crate) room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewaySendMessage {
    pub(crate) room_id: String,
    pub(crate) content: String,
}
