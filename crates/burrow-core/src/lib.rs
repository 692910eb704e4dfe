#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "burrow"
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("username is invalid")]
    InvalidUsername,
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("room id is invalid")]
    InvalidRoomId,
    #[error("room name is invalid")]
    InvalidRoomName,
    #[error("message content is invalid")]
    InvalidMessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidUserId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a persisted chat room. ULID-backed so that room ids sort by
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(Ulid);

impl RoomId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for RoomId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidRoomId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for RoomId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_username(&value)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomName(String);

impl RoomName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_name(&value, 1, 64)?;
        Ok(Self(value))
    }
}

/// Kind of durable notification fanned out to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RoomCreated,
    MessageReceived,
}

impl NotificationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoomCreated => "room_created",
            Self::MessageReceived => "message_received",
        }
    }
}

impl TryFrom<String> for NotificationKind {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "room_created" => Ok(Self::RoomCreated),
            "message_received" => Ok(Self::MessageReceived),
            _ => Err(DomainError::InvalidMessageContent),
        }
    }
}

/// Trim message content and enforce the size bounds shared by the REST and
/// gateway send paths. Returns the trimmed content.
///
/// # Errors
/// Returns [`DomainError::InvalidMessageContent`] when the trimmed content is
/// empty or longer than `max_bytes`.
pub fn normalize_message_content(content: &str, max_bytes: usize) -> Result<&str, DomainError> {
    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed.len() > max_bytes {
        return Err(DomainError::InvalidMessageContent);
    }
    Ok(trimmed)
}

fn validate_username(value: &str) -> Result<(), DomainError> {
    if !(3..=32).contains(&value.len()) {
        return Err(DomainError::InvalidUsername);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Ok(());
    }

    Err(DomainError::InvalidUsername)
}

fn validate_name(value: &str, min: usize, max: usize) -> Result<(), DomainError> {
    if !(min..=max).contains(&value.len()) {
        return Err(DomainError::InvalidRoomName);
    }

    if value.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Ok(());
    }

    Err(DomainError::InvalidRoomName)
}

#[cfg(test)]
mod tests {
    use super::{
        normalize_message_content, project_name, DomainError, NotificationKind, RoomId, RoomName,
        UserId, Username,
    };

    #[test]
    fn project_name_is_stable() {
        assert_eq!(project_name(), "burrow");
    }

    #[test]
    fn username_invariants_enforced() {
        let valid = Username::try_from(String::from("alice_1")).unwrap();
        assert_eq!(valid.as_str(), "alice_1");
        assert_eq!(
            Username::try_from(String::from("a")).unwrap_err(),
            DomainError::InvalidUsername
        );
        assert_eq!(
            Username::try_from(String::from("bad-name")).unwrap_err(),
            DomainError::InvalidUsername
        );
    }

    #[test]
    fn room_name_enforces_bounds() {
        let name = RoomName::try_from(String::from("Weekend plans")).unwrap();
        assert_eq!(name.as_str(), "Weekend plans");
        assert!(RoomName::try_from(String::new()).is_err());
        assert!(RoomName::try_from("x".repeat(65)).is_err());
    }

    #[test]
    fn user_id_round_trip_and_parse_validation() {
        let id = UserId::new();
        let parsed = UserId::try_from(id.to_string()).unwrap();
        assert_eq!(id, parsed);

        let invalid = UserId::try_from(String::from("not-a-ulid")).unwrap_err();
        assert_eq!(invalid, DomainError::InvalidUserId);
    }

    #[test]
    fn room_id_round_trip() {
        let id = RoomId::new();
        assert_eq!(RoomId::try_from(id.to_string()).unwrap(), id);
        assert_eq!(
            RoomId::try_from(String::from("???")).unwrap_err(),
            DomainError::InvalidRoomId
        );
    }

    #[test]
    fn notification_kind_string_round_trip() {
        assert_eq!(
            NotificationKind::try_from(String::from("room_created")).unwrap(),
            NotificationKind::RoomCreated
        );
        assert_eq!(NotificationKind::MessageReceived.as_str(), "message_received");
        assert!(NotificationKind::try_from(String::from("other")).is_err());
    }

    #[test]
    fn message_content_is_trimmed_and_bounded() {
        assert_eq!(normalize_message_content("  hello  ", 2000).unwrap(), "hello");
        assert_eq!(
            normalize_message_content("   ", 2000).unwrap_err(),
            DomainError::InvalidMessageContent
        );
        assert!(normalize_message_content(&"x".repeat(2001), 2000).is_err());
    }
}
