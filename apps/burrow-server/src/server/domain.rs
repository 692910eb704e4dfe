use std::collections::{HashMap, HashSet};

use burrow_core::{
    normalize_message_content, NotificationKind, RoomId, RoomName, UserId,
};
use sqlx::Row;
use ulid::Ulid;

use super::{
    auth::now_unix,
    core::{
        AppState, AuthContext, MessageRecord, NotificationRecord, RoomMemberRecord, RoomRecord,
        DEFAULT_MESSAGE_PAGE_LIMIT, MAX_MESSAGE_PAGE_LIMIT, MAX_NOTIFICATION_PAGE_LIMIT,
    },
    errors::ApiFailure,
    gateway_events,
    realtime::{broadcast_room_event, send_user_event},
    types::{MessageResponse, NotificationResponse, RoomMemberResponse, RoomResponse},
};

fn db_error(op: &'static str) -> impl Fn(sqlx::Error) -> ApiFailure {
    move |e| {
        tracing::error!(event = "db.query", op, error = %e);
        ApiFailure::Internal
    }
}

pub(crate) async fn user_exists(state: &AppState, user_id: &str) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM users WHERE user_id = $1) AS present")
            .bind(user_id)
            .fetch_one(pool)
            .await
            .map_err(db_error("user_exists"))?;
        return row.try_get("present").map_err(db_error("user_exists"));
    }
    Ok(state.user_ids.read().await.contains_key(user_id))
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Blocks are directed edges with a symmetric effect: either direction
/// suppresses direct messaging and notification fan-out between the pair.
pub(crate) async fn is_blocked_between(
    state: &AppState,
    user_a: &str,
    user_b: &str,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT EXISTS (
                SELECT 1 FROM blocks
                WHERE (blocker_id = $1 AND blocked_id = $2)
                   OR (blocker_id = $2 AND blocked_id = $1)
            ) AS present",
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_one(pool)
        .await
        .map_err(db_error("is_blocked_between"))?;
        return row.try_get("present").map_err(db_error("is_blocked_between"));
    }

    let blocks = state.blocks.read().await;
    Ok(blocks.contains(&(user_a.to_owned(), user_b.to_owned()))
        || blocks.contains(&(user_b.to_owned(), user_a.to_owned())))
}

pub(crate) async fn block_user(
    state: &AppState,
    blocker: &AuthContext,
    blocked_user_id: &str,
) -> Result<(), ApiFailure> {
    UserId::try_from(blocked_user_id.to_owned()).map_err(|_| ApiFailure::InvalidRequest)?;
    let blocker_id = blocker.user_id.to_string();
    if blocker_id == blocked_user_id {
        return Err(ApiFailure::InvalidRequest);
    }
    if !user_exists(state, blocked_user_id).await? {
        return Err(ApiFailure::NotFound);
    }

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO blocks (blocker_id, blocked_id, created_at_unix)
             VALUES ($1, $2, $3)
             ON CONFLICT (blocker_id, blocked_id) DO NOTHING",
        )
        .bind(&blocker_id)
        .bind(blocked_user_id)
        .bind(now_unix())
        .execute(pool)
        .await
        .map_err(db_error("block_user"))?;
    } else {
        state
            .blocks
            .write()
            .await
            .insert((blocker_id.clone(), blocked_user_id.to_owned()));
    }

    tracing::info!(event = "block.create", blocker_id = %blocker_id, blocked_id = %blocked_user_id);
    Ok(())
}

pub(crate) async fn unblock_user(
    state: &AppState,
    blocker: &AuthContext,
    blocked_user_id: &str,
) -> Result<(), ApiFailure> {
    UserId::try_from(blocked_user_id.to_owned()).map_err(|_| ApiFailure::InvalidRequest)?;
    let blocker_id = blocker.user_id.to_string();

    if let Some(pool) = &state.db_pool {
        sqlx::query("DELETE FROM blocks WHERE blocker_id = $1 AND blocked_id = $2")
            .bind(&blocker_id)
            .bind(blocked_user_id)
            .execute(pool)
            .await
            .map_err(db_error("unblock_user"))?;
    } else {
        state
            .blocks
            .write()
            .await
            .remove(&(blocker_id.clone(), blocked_user_id.to_owned()));
    }

    tracing::info!(event = "block.delete", blocker_id = %blocker_id, blocked_id = %blocked_user_id);
    Ok(())
}

pub(crate) async fn list_blocks(
    state: &AppState,
    blocker: &AuthContext,
) -> Result<Vec<String>, ApiFailure> {
    let blocker_id = blocker.user_id.to_string();
    if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT blocked_id FROM blocks WHERE blocker_id = $1 ORDER BY blocked_id",
        )
        .bind(&blocker_id)
        .fetch_all(pool)
        .await
        .map_err(db_error("list_blocks"))?;
        return rows
            .into_iter()
            .map(|row| row.try_get("blocked_id").map_err(db_error("list_blocks")))
            .collect();
    }

    let mut blocked: Vec<String> = state
        .blocks
        .read()
        .await
        .iter()
        .filter(|(from, _)| *from == blocker_id)
        .map(|(_, to)| to.clone())
        .collect();
    blocked.sort();
    Ok(blocked)
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

pub(crate) async fn is_room_member(
    state: &AppState,
    room_id: &str,
    user_id: &str,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT EXISTS (
                SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2
            ) AS present",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(db_error("is_room_member"))?;
        return row.try_get("present").map_err(db_error("is_room_member"));
    }

    Ok(state
        .rooms
        .read()
        .await
        .get(room_id)
        .is_some_and(|room| room.members.contains_key(user_id)))
}

async fn room_member_ids(state: &AppState, room_id: &str) -> Result<Vec<String>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let rows = sqlx::query("SELECT user_id FROM room_members WHERE room_id = $1")
            .bind(room_id)
            .fetch_all(pool)
            .await
            .map_err(db_error("room_member_ids"))?;
        return rows
            .into_iter()
            .map(|row| row.try_get("user_id").map_err(db_error("room_member_ids")))
            .collect();
    }

    Ok(state
        .rooms
        .read()
        .await
        .get(room_id)
        .map(|room| room.members.keys().cloned().collect())
        .unwrap_or_default())
}

fn sorted_members(members: &HashMap<String, RoomMemberRecord>) -> Vec<RoomMemberResponse> {
    let mut out: Vec<RoomMemberResponse> = members
        .iter()
        .map(|(user_id, member)| RoomMemberResponse {
            user_id: user_id.clone(),
            joined_at_unix: member.joined_at_unix,
        })
        .collect();
    out.sort_by(|a, b| (a.joined_at_unix, &a.user_id).cmp(&(b.joined_at_unix, &b.user_id)));
    out
}

fn room_response_from_record(room_id: &str, room: &RoomRecord, viewer_id: &str) -> RoomResponse {
    RoomResponse {
        room_id: room_id.to_owned(),
        name: room.name.as_ref().map(|name| name.as_str().to_owned()),
        is_group: room.is_group,
        created_by_user_id: room.created_by_user_id.to_string(),
        members: sorted_members(&room.members),
        unread_count: room
            .members
            .get(viewer_id)
            .map_or(0, |member| member.unread_count),
        last_message_id: room.last_message_id.clone(),
        created_at_unix: room.created_at_unix,
        updated_at_unix: room.updated_at_unix,
    }
}

async fn fetch_room_response(
    state: &AppState,
    room_id: &str,
    viewer_id: &str,
) -> Result<RoomResponse, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT name, is_group, created_by_user_id, last_message_id,
                    created_at_unix, updated_at_unix
             FROM rooms WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(pool)
        .await
        .map_err(db_error("fetch_room"))?
        .ok_or(ApiFailure::NotFound)?;

        let member_rows = sqlx::query(
            "SELECT user_id, unread_count, joined_at_unix
             FROM room_members WHERE room_id = $1
             ORDER BY joined_at_unix, user_id",
        )
        .bind(room_id)
        .fetch_all(pool)
        .await
        .map_err(db_error("fetch_room_members"))?;

        let mut members = Vec::with_capacity(member_rows.len());
        let mut unread_count = 0_i64;
        for member in member_rows {
            let user_id: String = member.try_get("user_id").map_err(db_error("fetch_room"))?;
            if user_id == viewer_id {
                unread_count = member
                    .try_get("unread_count")
                    .map_err(db_error("fetch_room"))?;
            }
            members.push(RoomMemberResponse {
                joined_at_unix: member
                    .try_get("joined_at_unix")
                    .map_err(db_error("fetch_room"))?,
                user_id,
            });
        }

        return Ok(RoomResponse {
            room_id: room_id.to_owned(),
            name: row.try_get("name").map_err(db_error("fetch_room"))?,
            is_group: row.try_get("is_group").map_err(db_error("fetch_room"))?,
            created_by_user_id: row
                .try_get("created_by_user_id")
                .map_err(db_error("fetch_room"))?,
            members,
            unread_count,
            last_message_id: row
                .try_get("last_message_id")
                .map_err(db_error("fetch_room"))?,
            created_at_unix: row
                .try_get("created_at_unix")
                .map_err(db_error("fetch_room"))?,
            updated_at_unix: row
                .try_get("updated_at_unix")
                .map_err(db_error("fetch_room"))?,
        });
    }

    let rooms = state.rooms.read().await;
    let room = rooms.get(room_id).ok_or(ApiFailure::NotFound)?;
    Ok(room_response_from_record(room_id, room, viewer_id))
}

async fn find_direct_room(
    state: &AppState,
    user_a: &str,
    user_b: &str,
) -> Result<Option<String>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT r.room_id FROM rooms r
             JOIN room_members m1 ON m1.room_id = r.room_id AND m1.user_id = $1
             JOIN room_members m2 ON m2.room_id = r.room_id AND m2.user_id = $2
             WHERE r.is_group = FALSE
             ORDER BY r.room_id
             LIMIT 1",
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_optional(pool)
        .await
        .map_err(db_error("find_direct_room"))?;
        return row
            .map(|value| value.try_get("room_id").map_err(db_error("find_direct_room")))
            .transpose();
    }

    // Ids sort by creation time, so the oldest matching room wins on both paths.
    let rooms = state.rooms.read().await;
    Ok(rooms
        .iter()
        .filter(|(_, room)| {
            !room.is_group
                && room.members.contains_key(user_a)
                && room.members.contains_key(user_b)
        })
        .map(|(room_id, _)| room_id.clone())
        .min())
}

async fn insert_room(
    state: &AppState,
    room_id: &str,
    name: Option<&RoomName>,
    is_group: bool,
    creator_id: UserId,
    member_ids: &[String],
    now: i64,
) -> Result<(), ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let mut tx = pool.begin().await.map_err(db_error("create_room"))?;
        sqlx::query(
            "INSERT INTO rooms
                (room_id, name, is_group, created_by_user_id, created_at_unix, updated_at_unix)
             VALUES ($1, $2, $3, $4, $5, $5)",
        )
        .bind(room_id)
        .bind(name.map(RoomName::as_str))
        .bind(is_group)
        .bind(creator_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error("create_room"))?;

        for member_id in member_ids {
            sqlx::query(
                "INSERT INTO room_members (room_id, user_id, joined_at_unix)
                 VALUES ($1, $2, $3)",
            )
            .bind(room_id)
            .bind(member_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error("create_room"))?;
        }
        tx.commit().await.map_err(db_error("create_room"))?;
        return Ok(());
    }

    let members = member_ids
        .iter()
        .map(|member_id| {
            (
                member_id.clone(),
                RoomMemberRecord {
                    unread_count: 0,
                    joined_at_unix: now,
                },
            )
        })
        .collect();
    state.rooms.write().await.insert(
        room_id.to_owned(),
        RoomRecord {
            name: name.cloned(),
            is_group,
            created_by_user_id: creator_id,
            members,
            messages: Vec::new(),
            last_message_id: None,
            created_at_unix: now,
            updated_at_unix: now,
        },
    );
    Ok(())
}

async fn notify_room_created(
    state: &AppState,
    creator: &AuthContext,
    room: &RoomResponse,
) -> Result<(), ApiFailure> {
    let creator_id = creator.user_id.to_string();
    for member in &room.members {
        if member.user_id == creator_id {
            continue;
        }
        if is_blocked_between(state, &creator_id, &member.user_id).await? {
            continue;
        }
        let notification = push_notification(
            state,
            &member.user_id,
            NotificationKind::RoomCreated,
            &room.room_id,
            creator.user_id,
        )
        .await?;
        send_user_event(
            state,
            &member.user_id,
            &gateway_events::new_notification(&notification),
        )
        .await;
        send_user_event(state, &member.user_id, &gateway_events::room_created(room)).await;
    }
    Ok(())
}

/// Idempotent: a second direct-room request for the same pair returns the
/// existing room instead of creating a duplicate.
pub(crate) async fn create_direct_room(
    state: &AppState,
    creator: &AuthContext,
    other_user_id: &str,
) -> Result<(RoomResponse, bool), ApiFailure> {
    UserId::try_from(other_user_id.to_owned()).map_err(|_| ApiFailure::InvalidRequest)?;
    let creator_id = creator.user_id.to_string();
    if creator_id == other_user_id {
        return Err(ApiFailure::InvalidRequest);
    }
    if !user_exists(state, other_user_id).await? {
        return Err(ApiFailure::NotFound);
    }
    if is_blocked_between(state, &creator_id, other_user_id).await? {
        return Err(ApiFailure::Forbidden);
    }

    if let Some(existing) = find_direct_room(state, &creator_id, other_user_id).await? {
        let room = fetch_room_response(state, &existing, &creator_id).await?;
        return Ok((room, false));
    }

    let room_id = RoomId::new().to_string();
    let members = vec![creator_id.clone(), other_user_id.to_owned()];
    insert_room(
        state,
        &room_id,
        None,
        false,
        creator.user_id,
        &members,
        now_unix(),
    )
    .await?;

    tracing::info!(event = "room.create", room_id = %room_id, is_group = false, creator_id = %creator_id);
    let room = fetch_room_response(state, &room_id, &creator_id).await?;
    notify_room_created(state, creator, &room).await?;
    Ok((room, true))
}

pub(crate) async fn create_group_room(
    state: &AppState,
    creator: &AuthContext,
    name: &str,
    member_ids: &[String],
) -> Result<RoomResponse, ApiFailure> {
    let name =
        RoomName::try_from(name.to_owned()).map_err(|_| ApiFailure::InvalidRequest)?;
    let creator_id = creator.user_id.to_string();

    let mut members: Vec<String> = Vec::with_capacity(member_ids.len() + 1);
    let mut seen: HashSet<&str> = HashSet::new();
    members.push(creator_id.clone());
    seen.insert(creator_id.as_str());
    for member_id in member_ids {
        UserId::try_from(member_id.clone()).map_err(|_| ApiFailure::InvalidRequest)?;
        if seen.insert(member_id.as_str()) {
            members.push(member_id.clone());
        }
    }
    if members.len() < 2 || members.len() > state.runtime.max_group_room_members {
        return Err(ApiFailure::InvalidRequest);
    }
    for member_id in &members {
        if !user_exists(state, member_id).await? {
            return Err(ApiFailure::NotFound);
        }
    }

    // A named room that deduplicates down to two members is not a group; it
    // behaves like a direct room for blocking and reuse purposes.
    let is_group = members.len() > 2;
    let room_id = RoomId::new().to_string();
    insert_room(
        state,
        &room_id,
        Some(&name),
        is_group,
        creator.user_id,
        &members,
        now_unix(),
    )
    .await?;

    tracing::info!(event = "room.create", room_id = %room_id, is_group, creator_id = %creator_id, members = members.len());
    let room = fetch_room_response(state, &room_id, &creator_id).await?;
    notify_room_created(state, creator, &room).await?;
    Ok(room)
}

pub(crate) async fn list_rooms_for_user(
    state: &AppState,
    viewer: &AuthContext,
) -> Result<Vec<RoomResponse>, ApiFailure> {
    let viewer_id = viewer.user_id.to_string();
    let room_ids = rooms_of_user(state, &viewer_id).await?;

    let mut rooms = Vec::with_capacity(room_ids.len());
    for room_id in room_ids {
        rooms.push(fetch_room_response(state, &room_id, &viewer_id).await?);
    }
    rooms.sort_by(|a, b| {
        (b.updated_at_unix, &b.room_id).cmp(&(a.updated_at_unix, &a.room_id))
    });
    Ok(rooms)
}

pub(crate) async fn rooms_of_user(
    state: &AppState,
    user_id: &str,
) -> Result<Vec<String>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let rows = sqlx::query("SELECT room_id FROM room_members WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(pool)
            .await
            .map_err(db_error("rooms_of_user"))?;
        return rows
            .into_iter()
            .map(|row| row.try_get("room_id").map_err(db_error("rooms_of_user")))
            .collect();
    }

    Ok(state
        .rooms
        .read()
        .await
        .iter()
        .filter(|(_, room)| room.members.contains_key(user_id))
        .map(|(room_id, _)| room_id.clone())
        .collect())
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn require_membership(
    state: &AppState,
    room_id: &str,
    user_id: &str,
) -> Result<(), ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM rooms WHERE room_id = $1) AS present")
            .bind(room_id)
            .fetch_one(pool)
            .await
            .map_err(db_error("require_membership"))?;
        let room_exists: bool = row
            .try_get("present")
            .map_err(db_error("require_membership"))?;
        if !room_exists {
            return Err(ApiFailure::NotFound);
        }
    } else if !state.rooms.read().await.contains_key(room_id) {
        return Err(ApiFailure::NotFound);
    }

    if is_room_member(state, room_id, user_id).await? {
        Ok(())
    } else {
        Err(ApiFailure::Forbidden)
    }
}

async fn room_is_group(state: &AppState, room_id: &str) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT is_group FROM rooms WHERE room_id = $1")
            .bind(room_id)
            .fetch_optional(pool)
            .await
            .map_err(db_error("room_is_group"))?
            .ok_or(ApiFailure::NotFound)?;
        return row.try_get("is_group").map_err(db_error("room_is_group"));
    }

    state
        .rooms
        .read()
        .await
        .get(room_id)
        .map(|room| room.is_group)
        .ok_or(ApiFailure::NotFound)
}

/// Persist a message, bump unread counters, fan out the `newMessage` event to
/// room subscribers, and push durable notifications to eligible members.
pub(crate) async fn append_message(
    state: &AppState,
    sender: &AuthContext,
    room_id: &str,
    content: &str,
) -> Result<MessageResponse, ApiFailure> {
    let sender_id = sender.user_id.to_string();
    require_membership(state, room_id, &sender_id).await?;

    let is_group = room_is_group(state, room_id).await?;
    let members = room_member_ids(state, room_id).await?;
    if !is_group {
        for member_id in &members {
            if *member_id != sender_id
                && is_blocked_between(state, &sender_id, member_id).await?
            {
                return Err(ApiFailure::Forbidden);
            }
        }
    }

    let content = normalize_message_content(content, state.runtime.max_message_content_bytes)
        .map_err(|_| ApiFailure::InvalidRequest)?;
    let message_id = Ulid::new().to_string();
    let now = now_unix();

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO messages (message_id, room_id, sender_id, content, created_at_unix)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&message_id)
        .bind(room_id)
        .bind(&sender_id)
        .bind(content)
        .bind(now)
        .execute(pool)
        .await
        .map_err(db_error("append_message"))?;

        sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at_unix)
             VALUES ($1, $2, $3)",
        )
        .bind(&message_id)
        .bind(&sender_id)
        .bind(now)
        .execute(pool)
        .await
        .map_err(db_error("append_message"))?;

        sqlx::query(
            "UPDATE room_members SET unread_count = unread_count + 1
             WHERE room_id = $1 AND user_id <> $2",
        )
        .bind(room_id)
        .bind(&sender_id)
        .execute(pool)
        .await
        .map_err(db_error("append_message"))?;

        // Counter maintenance must not lose an already persisted message.
        if let Err(e) = sqlx::query(
            "UPDATE rooms SET last_message_id = $2, updated_at_unix = $3 WHERE room_id = $1",
        )
        .bind(room_id)
        .bind(&message_id)
        .bind(now)
        .execute(pool)
        .await
        {
            tracing::warn!(event = "room.counters", room_id = %room_id, error = %e);
        }
    } else {
        let mut rooms = state.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(ApiFailure::NotFound)?;
        room.messages.push(MessageRecord {
            id: message_id.clone(),
            sender_id: sender.user_id,
            content: content.to_owned(),
            read_by: HashSet::from([sender_id.clone()]),
            created_at_unix: now,
        });
        for (member_id, member) in &mut room.members {
            if *member_id != sender_id {
                member.unread_count += 1;
            }
        }
        room.last_message_id = Some(message_id.clone());
        room.updated_at_unix = now;
    }

    let message = MessageResponse {
        message_id,
        room_id: room_id.to_owned(),
        sender_id: sender_id.clone(),
        sender_username: sender.username.clone(),
        content: content.to_owned(),
        read_by: vec![sender_id.clone()],
        created_at_unix: now,
    };

    tracing::info!(event = "message.create", room_id = %room_id, message_id = %message.message_id, sender_id = %sender_id);
    broadcast_room_event(state, room_id, &gateway_events::new_message(&message)).await;

    for member_id in &members {
        if *member_id == sender_id {
            continue;
        }
        if is_blocked_between(state, &sender_id, member_id).await? {
            continue;
        }
        let notification = push_notification(
            state,
            member_id,
            NotificationKind::MessageReceived,
            room_id,
            sender.user_id,
        )
        .await?;
        send_user_event(
            state,
            member_id,
            &gateway_events::new_notification(&notification),
        )
        .await;
    }

    Ok(message)
}

/// Ascending by message id; `before` is an exclusive upper bound for paging
/// backwards through history.
pub(crate) async fn list_messages(
    state: &AppState,
    viewer: &AuthContext,
    room_id: &str,
    limit: Option<usize>,
    before: Option<&str>,
) -> Result<Vec<MessageResponse>, ApiFailure> {
    let viewer_id = viewer.user_id.to_string();
    require_membership(state, room_id, &viewer_id).await?;
    let limit = limit
        .unwrap_or(DEFAULT_MESSAGE_PAGE_LIMIT)
        .min(MAX_MESSAGE_PAGE_LIMIT);

    if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT m.message_id, m.sender_id, u.username AS sender_username,
                    m.content, m.created_at_unix
             FROM messages m
             JOIN users u ON u.user_id = m.sender_id
             WHERE m.room_id = $1 AND ($2::TEXT IS NULL OR m.message_id < $2)
             ORDER BY m.message_id DESC
             LIMIT $3",
        )
        .bind(room_id)
        .bind(before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await
        .map_err(db_error("list_messages"))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(MessageResponse {
                message_id: row.try_get("message_id").map_err(db_error("list_messages"))?,
                room_id: room_id.to_owned(),
                sender_id: row.try_get("sender_id").map_err(db_error("list_messages"))?,
                sender_username: row
                    .try_get("sender_username")
                    .map_err(db_error("list_messages"))?,
                content: row.try_get("content").map_err(db_error("list_messages"))?,
                read_by: Vec::new(),
                created_at_unix: row
                    .try_get("created_at_unix")
                    .map_err(db_error("list_messages"))?,
            });
        }
        messages.reverse();

        let ids: Vec<String> = messages
            .iter()
            .map(|message| message.message_id.clone())
            .collect();
        if !ids.is_empty() {
            let read_rows = sqlx::query(
                "SELECT message_id, user_id FROM message_reads
                 WHERE message_id = ANY($1)
                 ORDER BY user_id",
            )
            .bind(&ids)
            .fetch_all(pool)
            .await
            .map_err(db_error("list_messages"))?;
            let mut reads: HashMap<String, Vec<String>> = HashMap::new();
            for row in read_rows {
                let message_id: String =
                    row.try_get("message_id").map_err(db_error("list_messages"))?;
                let user_id: String =
                    row.try_get("user_id").map_err(db_error("list_messages"))?;
                reads.entry(message_id).or_default().push(user_id);
            }
            for message in &mut messages {
                if let Some(read_by) = reads.remove(&message.message_id) {
                    message.read_by = read_by;
                }
            }
        }
        return Ok(messages);
    }

    let user_ids = state.user_ids.read().await;
    let rooms = state.rooms.read().await;
    let room = rooms.get(room_id).ok_or(ApiFailure::NotFound)?;
    let mut messages: Vec<MessageResponse> = room
        .messages
        .iter()
        .filter(|record| before.is_none_or(|bound| record.id.as_str() < bound))
        .map(|record| {
            let mut read_by: Vec<String> = record.read_by.iter().cloned().collect();
            read_by.sort();
            let sender_id = record.sender_id.to_string();
            MessageResponse {
                message_id: record.id.clone(),
                room_id: room_id.to_owned(),
                sender_username: user_ids.get(&sender_id).cloned().unwrap_or_default(),
                sender_id,
                content: record.content.clone(),
                read_by,
                created_at_unix: record.created_at_unix,
            }
        })
        .collect();
    messages.sort_by(|a, b| a.message_id.cmp(&b.message_id));
    if messages.len() > limit {
        messages.drain(..messages.len() - limit);
    }
    Ok(messages)
}

/// Idempotent: marking an already read room leaves the zero counter in place.
pub(crate) async fn mark_room_read(
    state: &AppState,
    reader: &AuthContext,
    room_id: &str,
) -> Result<i64, ApiFailure> {
    let reader_id = reader.user_id.to_string();
    require_membership(state, room_id, &reader_id).await?;
    let now = now_unix();

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "UPDATE room_members SET unread_count = 0 WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id)
        .bind(&reader_id)
        .execute(pool)
        .await
        .map_err(db_error("mark_room_read"))?;

        sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at_unix)
             SELECT message_id, $2, $3 FROM messages WHERE room_id = $1
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(room_id)
        .bind(&reader_id)
        .bind(now)
        .execute(pool)
        .await
        .map_err(db_error("mark_room_read"))?;
    } else {
        let mut rooms = state.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(ApiFailure::NotFound)?;
        if let Some(member) = room.members.get_mut(&reader_id) {
            member.unread_count = 0;
        }
        for message in &mut room.messages {
            message.read_by.insert(reader_id.clone());
        }
    }

    broadcast_room_event(
        state,
        room_id,
        &gateway_events::room_marked_as_read(room_id, &reader_id, now),
    )
    .await;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

async fn push_notification(
    state: &AppState,
    recipient_id: &str,
    kind: NotificationKind,
    room_id: &str,
    actor_user_id: UserId,
) -> Result<NotificationResponse, ApiFailure> {
    let notification_id = Ulid::new().to_string();
    let now = now_unix();

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO notifications
                (notification_id, user_id, kind, room_id, actor_user_id, read, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, FALSE, $6)",
        )
        .bind(&notification_id)
        .bind(recipient_id)
        .bind(kind.as_str())
        .bind(room_id)
        .bind(actor_user_id.to_string())
        .bind(now)
        .execute(pool)
        .await
        .map_err(db_error("push_notification"))?;
    } else {
        state
            .notifications
            .write()
            .await
            .entry(recipient_id.to_owned())
            .or_default()
            .push(NotificationRecord {
                id: notification_id.clone(),
                kind,
                room_id: room_id.to_owned(),
                actor_user_id,
                read: false,
                created_at_unix: now,
            });
    }

    Ok(NotificationResponse {
        notification_id,
        kind,
        room_id: room_id.to_owned(),
        actor_user_id: actor_user_id.to_string(),
        read: false,
        created_at_unix: now,
    })
}

pub(crate) async fn list_notifications(
    state: &AppState,
    viewer: &AuthContext,
    limit: Option<usize>,
    unread_only: bool,
) -> Result<Vec<NotificationResponse>, ApiFailure> {
    let viewer_id = viewer.user_id.to_string();
    let limit = limit
        .unwrap_or(MAX_NOTIFICATION_PAGE_LIMIT)
        .min(MAX_NOTIFICATION_PAGE_LIMIT);

    if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT notification_id, kind, room_id, actor_user_id, read, created_at_unix
             FROM notifications WHERE user_id = $1 AND ($3 = FALSE OR read = FALSE)
             ORDER BY notification_id DESC
             LIMIT $2",
        )
        .bind(&viewer_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(unread_only)
        .fetch_all(pool)
        .await
        .map_err(db_error("list_notifications"))?;

        let mut notifications = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind").map_err(db_error("list_notifications"))?;
            notifications.push(NotificationResponse {
                notification_id: row
                    .try_get("notification_id")
                    .map_err(db_error("list_notifications"))?,
                kind: NotificationKind::try_from(kind).map_err(|_| ApiFailure::Internal)?,
                room_id: row.try_get("room_id").map_err(db_error("list_notifications"))?,
                actor_user_id: row
                    .try_get("actor_user_id")
                    .map_err(db_error("list_notifications"))?,
                read: row.try_get("read").map_err(db_error("list_notifications"))?,
                created_at_unix: row
                    .try_get("created_at_unix")
                    .map_err(db_error("list_notifications"))?,
            });
        }
        return Ok(notifications);
    }

    let notifications = state.notifications.read().await;
    let mut out: Vec<NotificationResponse> = notifications
        .get(&viewer_id)
        .map(|records| {
            records
                .iter()
                .filter(|record| !unread_only || !record.read)
                .map(|record| NotificationResponse {
                    notification_id: record.id.clone(),
                    kind: record.kind,
                    room_id: record.room_id.clone(),
                    actor_user_id: record.actor_user_id.to_string(),
                    read: record.read,
                    created_at_unix: record.created_at_unix,
                })
                .collect()
        })
        .unwrap_or_default();
    out.sort_by(|a, b| b.notification_id.cmp(&a.notification_id));
    out.truncate(limit);
    Ok(out)
}

pub(crate) async fn mark_notification_read(
    state: &AppState,
    viewer: &AuthContext,
    notification_id: &str,
) -> Result<NotificationResponse, ApiFailure> {
    let viewer_id = viewer.user_id.to_string();

    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "UPDATE notifications SET read = TRUE
             WHERE notification_id = $1 AND user_id = $2
             RETURNING kind, room_id, actor_user_id, created_at_unix",
        )
        .bind(notification_id)
        .bind(&viewer_id)
        .fetch_optional(pool)
        .await
        .map_err(db_error("mark_notification_read"))?
        .ok_or(ApiFailure::NotFound)?;

        let kind: String = row
            .try_get("kind")
            .map_err(db_error("mark_notification_read"))?;
        return Ok(NotificationResponse {
            notification_id: notification_id.to_owned(),
            kind: NotificationKind::try_from(kind).map_err(|_| ApiFailure::Internal)?,
            room_id: row
                .try_get("room_id")
                .map_err(db_error("mark_notification_read"))?,
            actor_user_id: row
                .try_get("actor_user_id")
                .map_err(db_error("mark_notification_read"))?,
            read: true,
            created_at_unix: row
                .try_get("created_at_unix")
                .map_err(db_error("mark_notification_read"))?,
        });
    }

    let mut notifications = state.notifications.write().await;
    let records = notifications
        .get_mut(&viewer_id)
        .ok_or(ApiFailure::NotFound)?;
    let record = records
        .iter_mut()
        .find(|record| record.id == notification_id)
        .ok_or(ApiFailure::NotFound)?;
    record.read = true;
    Ok(NotificationResponse {
        notification_id: record.id.clone(),
        kind: record.kind,
        room_id: record.room_id.clone(),
        actor_user_id: record.actor_user_id.to_string(),
        read: true,
        created_at_unix: record.created_at_unix,
    })
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

pub(crate) async fn has_live_connection(state: &AppState, user_id: &str) -> bool {
    state
        .connection_presence
        .read()
        .await
        .values()
        .any(|presence| presence.user_id.to_string() == user_id)
}

async fn online_flag(state: &AppState, user_id: &str) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT is_online FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .map_err(db_error("online_flag"))?
            .ok_or(ApiFailure::NotFound)?;
        return row.try_get("is_online").map_err(db_error("online_flag"));
    }

    let user_ids = state.user_ids.read().await;
    let username = user_ids.get(user_id).ok_or(ApiFailure::NotFound)?;
    let users = state.users.read().await;
    users
        .get(username)
        .map(|user| user.is_online)
        .ok_or(ApiFailure::NotFound)
}

/// A user reads as online only while the online flag is set AND at least one
/// gateway connection is open. Going invisible or dropping the last
/// connection both flip presence to offline.
pub(crate) async fn effective_presence(
    state: &AppState,
    user_id: &str,
) -> Result<bool, ApiFailure> {
    let flag = online_flag(state, user_id).await?;
    Ok(flag && has_live_connection(state, user_id).await)
}

pub(crate) async fn set_online_status(
    state: &AppState,
    user: &AuthContext,
    is_online: bool,
) -> Result<(), ApiFailure> {
    let user_id = user.user_id.to_string();

    if let Some(pool) = &state.db_pool {
        sqlx::query("UPDATE users SET is_online = $2 WHERE user_id = $1")
            .bind(&user_id)
            .bind(is_online)
            .execute(pool)
            .await
            .map_err(db_error("set_online_status"))?;
    } else {
        let mut users = state.users.write().await;
        if let Some(record) = users.get_mut(&user.username) {
            record.is_online = is_online;
        }
    }

    tracing::info!(event = "presence.flag", user_id = %user_id, is_online);
    broadcast_presence_for_user(state, &user_id).await
}

/// Push the user's effective presence to every room they belong to.
pub(crate) async fn broadcast_presence_for_user(
    state: &AppState,
    user_id: &str,
) -> Result<(), ApiFailure> {
    let online = effective_presence(state, user_id).await?;
    let event = gateway_events::presence_update(user_id, online);
    for room_id in rooms_of_user(state, user_id).await? {
        broadcast_room_event(state, &room_id, &event).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::core::AppConfig;

    fn direct_room_between(a: &str, b: &str, created_at_unix: i64) -> RoomRecord {
        let mut members = HashMap::new();
        for user_id in [a, b] {
            members.insert(
                user_id.to_owned(),
                RoomMemberRecord {
                    unread_count: 0,
                    joined_at_unix: created_at_unix,
                },
            );
        }
        RoomRecord {
            name: None,
            is_group: false,
            created_by_user_id: UserId::try_from(a.to_owned()).expect("user id should parse"),
            members,
            messages: Vec::new(),
            last_message_id: None,
            created_at_unix,
            updated_at_unix: created_at_unix,
        }
    }

    #[tokio::test]
    async fn direct_room_lookup_prefers_the_oldest_room_for_a_pair() {
        let state = AppState::new(&AppConfig::default()).expect("state should build");
        let alice = UserId::new().to_string();
        let bob = UserId::new().to_string();

        // Duplicate pair rooms can exist when two creations race; the lookup
        // must settle on one winner no matter the map's iteration order.
        let mut ids = [RoomId::new().to_string(), RoomId::new().to_string()];
        ids.sort();
        let [older, newer] = ids;
        {
            let mut rooms = state.rooms.write().await;
            rooms.insert(newer.clone(), direct_room_between(&alice, &bob, 2));
            rooms.insert(older.clone(), direct_room_between(&alice, &bob, 1));
        }

        for _ in 0..8 {
            let found = find_direct_room(&state, &alice, &bob)
                .await
                .expect("lookup should succeed");
            assert_eq!(found.as_deref(), Some(older.as_str()));
        }
    }
}
