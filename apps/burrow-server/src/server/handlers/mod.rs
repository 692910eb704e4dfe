pub(crate) mod auth;
pub(crate) mod messages;
pub(crate) mod notifications;
pub(crate) mod rooms;
pub(crate) mod users;
