use burrow_core::UserId;
use serde::Serialize;

use super::{envelope::build_event, GatewayEvent};

pub(crate) const READY_EVENT: &str = "ready";
pub(crate) const ERROR_EVENT: &str = "error";

#[derive(Serialize)]
struct ReadyPayload {
    user_id: String,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    code: &'static str,
    message: &'a str,
}

pub(crate) fn ready(user_id: UserId) -> GatewayEvent {
    build_event(
        READY_EVENT,
        ReadyPayload {
            user_id: user_id.to_string(),
        },
    )
}

/// Domain failures surface as an `error` event; the connection stays open.
pub(crate) fn gateway_error(code: &'static str, message: &str) -> GatewayEvent {
    build_event(ERROR_EVENT, ErrorPayload { code, message })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn parse_payload(event: &GatewayEvent) -> Value {
        let value: Value =
            serde_json::from_str(&event.payload).expect("gateway event payload should be valid");
        assert_eq!(value["v"], Value::from(1));
        assert_eq!(value["t"], Value::from(event.event_type));
        value["d"].clone()
    }

    #[test]
    fn ready_event_contains_authenticated_user_id() {
        let user_id = UserId::new();
        let payload = parse_payload(&ready(user_id));
        assert_eq!(payload["user_id"], Value::from(user_id.to_string()));
    }

    #[test]
    fn error_event_carries_code_and_message() {
        let payload = parse_payload(&gateway_error("forbidden", "not a member of this room"));
        assert_eq!(payload["code"], Value::from("forbidden"));
        assert_eq!(payload["message"], Value::from("not a member of this room"));
    }
}
