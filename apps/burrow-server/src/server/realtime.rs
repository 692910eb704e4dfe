use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use burrow_protocol::parse_envelope;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    auth::{authenticate_with_token, bearer_token, now_unix},
    core::{AppState, AuthContext, ConnectionControl, ConnectionPresence},
    domain::{append_message, broadcast_presence_for_user, is_room_member, mark_room_read},
    errors::ApiFailure,
    gateway_events::{self, GatewayEvent},
    metrics::{
        record_gateway_event_dropped, record_gateway_event_emitted, record_ws_disconnect,
        GATEWAY_DROP_REASON_CLOSED, GATEWAY_DROP_REASON_FULL_QUEUE,
    },
    types::{GatewayAuthQuery, GatewayRoomCommand, GatewaySendMessage},
};

fn failure_message(failure: ApiFailure) -> &'static str {
    match failure {
        ApiFailure::InvalidRequest => "request was rejected",
        ApiFailure::Unauthorized => "credentials were rejected",
        ApiFailure::Forbidden => "operation is not allowed",
        ApiFailure::NotFound => "resource does not exist",
        ApiFailure::RateLimited => "too many requests",
        ApiFailure::Internal => "internal error",
    }
}

pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiFailure> {
    let token = query
        .auth
        .or(query.access_token)
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(ApiFailure::Unauthorized)?;
    let auth = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_gateway_connection(state, socket, auth).await;
    }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(
    state: AppState,
    socket: WebSocket,
    auth: AuthContext,
) {
    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    state
        .connection_senders
        .write()
        .await
        .insert(connection_id, outbound_tx.clone());
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
    state
        .connection_controls
        .write()
        .await
        .insert(connection_id, control_tx);
    let first_connection_for_user = {
        let mut presence = state.connection_presence.write().await;
        let had_connection = presence
            .values()
            .any(|entry| entry.user_id == auth.user_id);
        presence.insert(
            connection_id,
            ConnectionPresence {
                user_id: auth.user_id,
                room_ids: HashSet::new(),
            },
        );
        !had_connection
    };

    let ready_event = gateway_events::ready(auth.user_id);
    let _ = outbound_tx.send(ready_event.payload).await;
    record_gateway_event_emitted("connection", ready_event.event_type);

    if first_connection_for_user {
        if let Err(failure) =
            broadcast_presence_for_user(&state, &auth.user_id.to_string()).await
        {
            tracing::warn!(event = "presence.broadcast", user_id = %auth.user_id, failure = %failure);
        }
    }

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let mut ingress = VecDeque::new();
    let mut disconnect_reason = "connection_closed";
    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !allow_gateway_ingress(
            &mut ingress,
            state.runtime.gateway_ingress_events_per_window,
            state.runtime.gateway_ingress_window,
        ) {
            disconnect_reason = "ingress_rate_limited";
            break;
        }

        let Ok(envelope) = parse_envelope(&payload) else {
            disconnect_reason = "invalid_envelope";
            break;
        };

        match envelope.t.as_str() {
            "join_room" => {
                let Ok(command) = serde_json::from_value::<GatewayRoomCommand>(envelope.d) else {
                    disconnect_reason = "invalid_join_room_payload";
                    break;
                };
                let member = match is_room_member(
                    &state,
                    &command.room_id,
                    &auth.user_id.to_string(),
                )
                .await
                {
                    Ok(member) => member,
                    Err(failure) => {
                        if !emit_domain_failure(&outbound_tx, failure) {
                            disconnect_reason = "outbound_queue_full";
                            break;
                        }
                        continue;
                    }
                };
                if !member {
                    if !emit_domain_failure(&outbound_tx, ApiFailure::Forbidden) {
                        disconnect_reason = "outbound_queue_full";
                        break;
                    }
                    continue;
                }

                add_subscription(
                    &state,
                    connection_id,
                    command.room_id.clone(),
                    outbound_tx.clone(),
                )
                .await;
                if let Some(presence) =
                    state.connection_presence.write().await.get_mut(&connection_id)
                {
                    presence.room_ids.insert(command.room_id.clone());
                }

                let joined = gateway_events::joined_room(
                    &command.room_id,
                    &auth.user_id.to_string(),
                    now_unix(),
                );
                broadcast_room_event(&state, &command.room_id, &joined).await;
            }
            "leave_room" => {
                let Ok(command) = serde_json::from_value::<GatewayRoomCommand>(envelope.d) else {
                    disconnect_reason = "invalid_leave_room_payload";
                    break;
                };
                remove_subscription(&state, connection_id, &command.room_id).await;
                if let Some(presence) =
                    state.connection_presence.write().await.get_mut(&connection_id)
                {
                    presence.room_ids.remove(&command.room_id);
                }

                let left = gateway_events::left_room(&command.room_id, &auth.user_id.to_string());
                broadcast_room_event(&state, &command.room_id, &left).await;
            }
            "send_message" => {
                let Ok(command) = serde_json::from_value::<GatewaySendMessage>(envelope.d) else {
                    disconnect_reason = "invalid_send_message_payload";
                    break;
                };
                if let Err(failure) =
                    append_message(&state, &auth, &command.room_id, &command.content).await
                {
                    if !emit_domain_failure(&outbound_tx, failure) {
                        disconnect_reason = "outbound_queue_full";
                        break;
                    }
                }
            }
            "mark_room_read" => {
                let Ok(command) = serde_json::from_value::<GatewayRoomCommand>(envelope.d) else {
                    disconnect_reason = "invalid_mark_room_read_payload";
                    break;
                };
                if let Err(failure) = mark_room_read(&state, &auth, &command.room_id).await {
                    if !emit_domain_failure(&outbound_tx, failure) {
                        disconnect_reason = "outbound_queue_full";
                        break;
                    }
                }
            }
            _ => {
                disconnect_reason = "unknown_event";
                break;
            }
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    remove_connection(&state, connection_id).await;
    send_task.abort();
}

/// Reports a rejected command on the connection without closing it. Returns
/// false when the outbound queue is full and the connection should drop.
fn emit_domain_failure(outbound_tx: &mpsc::Sender<String>, failure: ApiFailure) -> bool {
    let event = gateway_events::gateway_error(failure.error_code(), failure_message(failure));
    match outbound_tx.try_send(event.payload) {
        Ok(()) => {
            record_gateway_event_emitted("connection", event.event_type);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            record_gateway_event_dropped(
                "connection",
                event.event_type,
                GATEWAY_DROP_REASON_CLOSED,
            );
            false
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            record_gateway_event_dropped(
                "connection",
                event.event_type,
                GATEWAY_DROP_REASON_FULL_QUEUE,
            );
            false
        }
    }
}

fn dispatch_gateway_payload(
    listeners: &mut HashMap<Uuid, mpsc::Sender<String>>,
    payload: &str,
    event_type: &'static str,
    scope: &'static str,
    slow_connections: &mut Vec<Uuid>,
) -> usize {
    let mut delivered = 0usize;
    listeners.retain(
        |connection_id, sender| match sender.try_send(payload.to_owned()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped(scope, event_type, GATEWAY_DROP_REASON_CLOSED);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped(scope, event_type, GATEWAY_DROP_REASON_FULL_QUEUE);
                slow_connections.push(*connection_id);
                false
            }
        },
    );
    delivered
}

async fn close_slow_connections(state: &AppState, slow_connections: Vec<Uuid>) {
    if slow_connections.is_empty() {
        return;
    }

    let controls = state.connection_controls.read().await;
    for connection_id in slow_connections {
        if let Some(control) = controls.get(&connection_id) {
            let _ = control.send(ConnectionControl::Close);
        }
    }
}

pub(crate) async fn broadcast_room_event(state: &AppState, room_id: &str, event: &GatewayEvent) {
    let mut slow_connections = Vec::new();
    let mut delivered = 0usize;
    let mut subscriptions = state.subscriptions.write().await;
    if let Some(listeners) = subscriptions.get_mut(room_id) {
        delivered = dispatch_gateway_payload(
            listeners,
            &event.payload,
            event.event_type,
            "room",
            &mut slow_connections,
        );
        if listeners.is_empty() {
            subscriptions.remove(room_id);
        }
    }
    drop(subscriptions);

    close_slow_connections(state, slow_connections).await;
    if delivered > 0 {
        tracing::debug!(
            event = "gateway.event.emit",
            scope = "room",
            event_type = event.event_type,
            delivered
        );
        for _ in 0..delivered {
            record_gateway_event_emitted("room", event.event_type);
        }
    }
}

/// Deliver an event to every open connection of one user, regardless of room
/// subscriptions. Notifications ride this path.
pub(crate) async fn send_user_event(state: &AppState, user_id: &str, event: &GatewayEvent) {
    let connection_ids: Vec<Uuid> = state
        .connection_presence
        .read()
        .await
        .iter()
        .filter_map(|(connection_id, presence)| {
            (presence.user_id.to_string() == user_id).then_some(*connection_id)
        })
        .collect();
    if connection_ids.is_empty() {
        return;
    }

    let mut slow_connections = Vec::new();
    let mut delivered = 0usize;
    let mut senders = state.connection_senders.write().await;
    for connection_id in connection_ids {
        let Some(sender) = senders.get(&connection_id) else {
            continue;
        };
        match sender.try_send(event.payload.clone()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped("user", event.event_type, GATEWAY_DROP_REASON_CLOSED);
                senders.remove(&connection_id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped(
                    "user",
                    event.event_type,
                    GATEWAY_DROP_REASON_FULL_QUEUE,
                );
                slow_connections.push(connection_id);
                senders.remove(&connection_id);
            }
        }
    }
    drop(senders);

    close_slow_connections(state, slow_connections).await;
    if delivered > 0 {
        tracing::debug!(
            event = "gateway.event.emit",
            scope = "user",
            event_type = event.event_type,
            delivered
        );
        for _ in 0..delivered {
            record_gateway_event_emitted("user", event.event_type);
        }
    }
}

pub(crate) async fn add_subscription(
    state: &AppState,
    connection_id: Uuid,
    room_id: String,
    outbound_tx: mpsc::Sender<String>,
) {
    let mut subscriptions = state.subscriptions.write().await;
    subscriptions
        .entry(room_id)
        .or_default()
        .insert(connection_id, outbound_tx);
}

async fn remove_subscription(state: &AppState, connection_id: Uuid, room_id: &str) {
    let mut subscriptions = state.subscriptions.write().await;
    if let Some(listeners) = subscriptions.get_mut(room_id) {
        listeners.remove(&connection_id);
        if listeners.is_empty() {
            subscriptions.remove(room_id);
        }
    }
}

pub(crate) async fn remove_connection(state: &AppState, connection_id: Uuid) {
    let removed_presence = state
        .connection_presence
        .write()
        .await
        .remove(&connection_id);
    state
        .connection_controls
        .write()
        .await
        .remove(&connection_id);
    state
        .connection_senders
        .write()
        .await
        .remove(&connection_id);

    let mut subscriptions = state.subscriptions.write().await;
    subscriptions.retain(|_, listeners| {
        listeners.remove(&connection_id);
        !listeners.is_empty()
    });
    drop(subscriptions);

    let Some(removed_presence) = removed_presence else {
        return;
    };
    let user_has_other_connections = state
        .connection_presence
        .read()
        .await
        .values()
        .any(|entry| entry.user_id == removed_presence.user_id);
    if !user_has_other_connections {
        if let Err(failure) =
            broadcast_presence_for_user(state, &removed_presence.user_id.to_string()).await
        {
            tracing::warn!(
                event = "presence.broadcast",
                user_id = %removed_presence.user_id,
                failure = %failure
            );
        }
    }
}

pub(crate) fn allow_gateway_ingress(
    ingress: &mut VecDeque<Instant>,
    limit: u32,
    window: Duration,
) -> bool {
    let now = Instant::now();
    while ingress
        .front()
        .is_some_and(|oldest| now.duration_since(*oldest) > window)
    {
        let _ = ingress.pop_front();
    }

    if ingress.len() >= limit as usize {
        return false;
    }

    ingress.push_back(now);
    true
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use super::allow_gateway_ingress;

    #[test]
    fn ingress_limiter_rejects_burst_beyond_window_budget() {
        let mut ingress = VecDeque::new();
        for _ in 0..5 {
            assert!(allow_gateway_ingress(&mut ingress, 5, Duration::from_secs(10)));
        }
        assert!(!allow_gateway_ingress(&mut ingress, 5, Duration::from_secs(10)));
    }

    #[test]
    fn ingress_limiter_forgets_events_outside_window() {
        let mut ingress = VecDeque::new();
        assert!(allow_gateway_ingress(&mut ingress, 1, Duration::from_secs(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(allow_gateway_ingress(&mut ingress, 1, Duration::from_secs(0)));
    }
}
