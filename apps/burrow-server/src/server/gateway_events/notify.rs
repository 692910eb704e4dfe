use super::{envelope::build_event, GatewayEvent};
use crate::server::types::NotificationResponse;

pub(crate) const NEW_NOTIFICATION_EVENT: &str = "newNotification";

pub(crate) fn new_notification(notification: &NotificationResponse) -> GatewayEvent {
    build_event(NEW_NOTIFICATION_EVENT, notification)
}
