use std::net::SocketAddr;

use axum::{
    extract::{connect_info::ConnectInfo, Extension, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use sqlx::Row;
use ulid::Ulid;

use burrow_core::Username;

use crate::server::{
    auth::{
        authenticate, enforce_auth_route_rate_limit, find_username_by_user_id, hash_password,
        hash_refresh_token, issue_tokens, now_unix, resolve_client_ip, validate_password,
    },
    auth_repository::{
        refresh_session_ttl_unix, AuthPersistence, AuthRepository, RefreshCheckError,
    },
    core::{AppState, ACCESS_TOKEN_TTL_SECS},
    db::ensure_db_schema,
    errors::ApiFailure,
    types::{AuthResponse, LoginRequest, MeResponse, RefreshRequest, RegisterRequest, RegisterResponse},
};

const MAX_REFRESH_TOKEN_CHARS: usize = 512;

pub(crate) async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let client_ip = resolve_client_ip(
        &headers,
        connect_info.as_ref().map(|value| value.0 .0.ip()),
    );
    enforce_auth_route_rate_limit(&state, client_ip, "register").await?;

    let username = Username::try_from(payload.username).map_err(|_| ApiFailure::InvalidRequest)?;
    validate_password(&payload.password)?;
    let password_hash = hash_password(&payload.password).map_err(|_| ApiFailure::Internal)?;
    let repository = AuthRepository::from_state(&state);

    // Registration never reveals whether the username was already taken.
    let created = repository
        .create_user_if_missing(&username, &password_hash)
        .await?;
    if created {
        tracing::info!(event = "auth.register", outcome = "created");
    } else {
        tracing::info!(event = "auth.register", outcome = "existing_user");
    }

    Ok(Json(RegisterResponse { accepted: true }))
}

pub(crate) async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let client_ip = resolve_client_ip(
        &headers,
        connect_info.as_ref().map(|value| value.0 .0.ip()),
    );
    enforce_auth_route_rate_limit(&state, client_ip, "login").await?;

    let username = Username::try_from(payload.username).map_err(|_| ApiFailure::Unauthorized)?;
    validate_password(&payload.password).map_err(|_| ApiFailure::Unauthorized)?;
    let now = now_unix();
    let repository = AuthRepository::from_state(&state);
    let user_id = repository
        .verify_credentials(
            &username,
            &payload.password,
            &state.dummy_password_hash,
            now,
        )
        .await?;
    let Some(user_id) = user_id else {
        tracing::warn!(event = "auth.login", outcome = "invalid_credentials");
        return Err(ApiFailure::Unauthorized);
    };

    let session_id = Ulid::new().to_string();
    let (access_token, refresh_token, refresh_hash) =
        issue_tokens(&state, user_id, username.as_str(), &session_id)
            .map_err(|_| ApiFailure::Internal)?;
    repository
        .insert_session(
            &session_id,
            user_id,
            refresh_hash,
            refresh_session_ttl_unix(now),
        )
        .await?;

    tracing::info!(event = "auth.login", outcome = "success", user_id = %user_id);

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

pub(crate) async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let client_ip = resolve_client_ip(
        &headers,
        connect_info.as_ref().map(|value| value.0 .0.ip()),
    );
    enforce_auth_route_rate_limit(&state, client_ip, "refresh").await?;

    if payload.refresh_token.is_empty() || payload.refresh_token.len() > MAX_REFRESH_TOKEN_CHARS {
        tracing::warn!(event = "auth.refresh", outcome = "invalid_token_format");
        return Err(ApiFailure::Unauthorized);
    }

    let now = now_unix();
    let repository = AuthRepository::from_state(&state);
    let refresh_check = repository
        .check_refresh_token(&payload.refresh_token, now)
        .await
        .map_err(|error| match error {
            RefreshCheckError::ReplayDetected { session_id } => {
                tracing::warn!(event = "auth.refresh", outcome = "replay_detected", session_id = %session_id);
                ApiFailure::Unauthorized
            }
            RefreshCheckError::Unauthorized { session_id } => {
                tracing::warn!(event = "auth.refresh", outcome = "rejected", session_id = %session_id);
                ApiFailure::Unauthorized
            }
            RefreshCheckError::Internal => ApiFailure::Internal,
        })?;

    let session_id = refresh_check.session_id;
    let user_id = refresh_check.user_id;
    let token_hash = refresh_check.presented_hash;
    let username = find_username_by_user_id(&state, user_id)
        .await
        .ok_or(ApiFailure::Unauthorized)?;

    let (access_token, refresh_token, refresh_hash) =
        issue_tokens(&state, user_id, &username, &session_id).map_err(|_| ApiFailure::Internal)?;
    repository
        .rotate_refresh_token(
            &session_id,
            token_hash,
            refresh_hash,
            refresh_session_ttl_unix(now_unix()),
        )
        .await?;

    tracing::info!(event = "auth.refresh", outcome = "success", session_id = %session_id, user_id = %user_id);

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

pub(crate) async fn logout(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<StatusCode, ApiFailure> {
    ensure_db_schema(&state).await?;
    if payload.refresh_token.is_empty() || payload.refresh_token.len() > MAX_REFRESH_TOKEN_CHARS {
        tracing::warn!(event = "auth.logout", outcome = "invalid_token_format");
        return Err(ApiFailure::Unauthorized);
    }

    let session_id = payload
        .refresh_token
        .split('.')
        .next()
        .ok_or(ApiFailure::Unauthorized)?
        .to_owned();
    let token_hash = hash_refresh_token(&payload.refresh_token);
    let repository = AuthRepository::from_state(&state);
    let user_id = repository
        .revoke_session_with_token(&session_id, token_hash)
        .await
        .map_err(|_| {
            tracing::warn!(event = "auth.logout", outcome = "hash_mismatch", session_id = %session_id);
            ApiFailure::Unauthorized
        })?;
    tracing::info!(event = "auth.logout", outcome = "success", session_id = %session_id, user_id = %user_id);
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT username, is_online FROM users WHERE user_id = $1")
            .bind(auth.user_id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?
            .ok_or(ApiFailure::Unauthorized)?;
        let username: String = row.try_get("username").map_err(|_| ApiFailure::Internal)?;
        let is_online: bool = row.try_get("is_online").map_err(|_| ApiFailure::Internal)?;

        return Ok(Json(MeResponse {
            user_id: auth.user_id.to_string(),
            username,
            is_online,
        }));
    }

    let users = state.users.read().await;
    let user = users.get(&auth.username).ok_or(ApiFailure::Unauthorized)?;

    Ok(Json(MeResponse {
        user_id: auth.user_id.to_string(),
        username: user.username.as_str().to_owned(),
        is_online: user.is_online,
    }))
}
