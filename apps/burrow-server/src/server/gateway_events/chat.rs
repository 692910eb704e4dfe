use serde::Serialize;

use super::{envelope::build_event, GatewayEvent};
use crate::server::types::{MessageResponse, RoomResponse};

pub(crate) const NEW_MESSAGE_EVENT: &str = "newMessage";
pub(crate) const JOINED_ROOM_EVENT: &str = "joinedRoom";
pub(crate) const LEFT_ROOM_EVENT: &str = "leftRoom";
pub(crate) const ROOM_CREATED_EVENT: &str = "room_created";
pub(crate) const ROOM_MARKED_AS_READ_EVENT: &str = "room_marked_as_read";
pub(crate) const PRESENCE_UPDATE_EVENT: &str = "presence_update";

#[derive(Serialize)]
struct JoinedRoomPayload<'a> {
    room_id: &'a str,
    user_id: &'a str,
    joined_at_unix: i64,
}

#[derive(Serialize)]
struct LeftRoomPayload<'a> {
    room_id: &'a str,
    user_id: &'a str,
}

#[derive(Serialize)]
struct RoomMarkedAsReadPayload<'a> {
    room_id: &'a str,
    user_id: &'a str,
    read_at_unix: i64,
}

#[derive(Serialize)]
struct PresenceUpdatePayload<'a> {
    user_id: &'a str,
    status: &'static str,
}

pub(crate) fn new_message(message: &MessageResponse) -> GatewayEvent {
    build_event(NEW_MESSAGE_EVENT, message)
}

pub(crate) fn joined_room(room_id: &str, user_id: &str, joined_at_unix: i64) -> GatewayEvent {
    build_event(
        JOINED_ROOM_EVENT,
        JoinedRoomPayload {
            room_id,
            user_id,
            joined_at_unix,
        },
    )
}

pub(crate) fn left_room(room_id: &str, user_id: &str) -> GatewayEvent {
    build_event(LEFT_ROOM_EVENT, LeftRoomPayload { room_id, user_id })
}

pub(crate) fn room_created(room: &RoomResponse) -> GatewayEvent {
    build_event(ROOM_CREATED_EVENT, room)
}

pub(crate) fn room_marked_as_read(room_id: &str, user_id: &str, read_at_unix: i64) -> GatewayEvent {
    build_event(
        ROOM_MARKED_AS_READ_EVENT,
        RoomMarkedAsReadPayload {
            room_id,
            user_id,
            read_at_unix,
        },
    )
}

pub(crate) fn presence_update(user_id: &str, online: bool) -> GatewayEvent {
    build_event(
        PRESENCE_UPDATE_EVENT,
        PresenceUpdatePayload {
            user_id,
            status: if online { "online" } else { "offline" },
        },
    )
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::server::gateway_events::GatewayEvent;

    fn parse_payload(event: &GatewayEvent) -> Value {
        let value: Value =
            serde_json::from_str(&event.payload).expect("gateway event payload should be valid");
        assert_eq!(value["t"], Value::from(event.event_type));
        value["d"].clone()
    }

    #[test]
    fn new_message_event_carries_full_message() {
        let message = MessageResponse {
            message_id: "01J0000000000000000000000M".to_owned(),
            room_id: "01J0000000000000000000000R".to_owned(),
            sender_id: "01J0000000000000000000000U".to_owned(),
            sender_username: "alice_1".to_owned(),
            content: "hello".to_owned(),
            read_by: vec![],
            created_at_unix: 1_700_000_000,
        };
        let payload = parse_payload(&new_message(&message));
        assert_eq!(payload["message_id"], Value::from(message.message_id));
        assert_eq!(payload["sender_username"], Value::from("alice_1"));
        assert_eq!(payload["content"], Value::from("hello"));
        assert_eq!(payload["read_by"], Value::Array(vec![]));
    }

    #[test]
    fn left_room_event_names_room_and_user() {
        let payload = parse_payload(&left_room("room-a", "user-b"));
        assert_eq!(payload["room_id"], Value::from("room-a"));
        assert_eq!(payload["user_id"], Value::from("user-b"));
    }

    #[test]
    fn joined_room_event_names_room_and_user() {
        let payload = parse_payload(&joined_room("room-a", "user-b", 42));
        assert_eq!(payload["room_id"], Value::from("room-a"));
        assert_eq!(payload["user_id"], Value::from("user-b"));
        assert_eq!(payload["joined_at_unix"], Value::from(42));
    }

    #[test]
    fn presence_update_maps_flag_to_status_string() {
        let online = parse_payload(&presence_update("user-a", true));
        assert_eq!(online["status"], Value::from("online"));
        let offline = parse_payload(&presence_update("user-a", false));
        assert_eq!(offline["status"], Value::from("offline"));
    }

    #[test]
    fn room_marked_as_read_event_carries_read_timestamp() {
        let payload = parse_payload(&room_marked_as_read("room-a", "user-b", 99));
        assert_eq!(payload["room_id"], Value::from("room-a"));
        assert_eq!(payload["read_at_unix"], Value::from(99));
    }
}
