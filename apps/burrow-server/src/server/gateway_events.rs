mod chat;
mod connection;
mod envelope;
mod notify;

pub(crate) use chat::{
    joined_room, left_room, new_message, presence_update, room_created, room_marked_as_read,
};
pub(crate) use connection::{gateway_error, ready};
pub(crate) use envelope::GatewayEvent;
pub(crate) use notify::new_notification;
