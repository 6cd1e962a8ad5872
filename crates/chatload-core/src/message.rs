use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Join,
    Leave,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
        }
    }

    /// Weighted pick from a roll in `[0, 100)`: 90% TEXT, 5% JOIN, 5% LEAVE.
    pub fn from_roll(roll: u32) -> Self {
        match roll {
            0..=89 => MessageType::Text,
            90..=94 => MessageType::Join,
            _ => MessageType::Leave,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of synthetic work. Immutable once generated.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub user_id: u32,
    pub body: &'static str,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    /// Carried for reporting only; routing is decided by the connection path
    pub room: u32,
}

impl ChatMessage {
    pub fn new(user_id: u32, body: &'static str, message_type: MessageType, room: u32) -> Self {
        Self {
            user_id,
            body,
            message_type,
            created_at: Utc::now(),
            room,
        }
    }

    pub fn username(&self) -> String {
        format!("user{}", self.user_id)
    }

    pub fn to_wire(&self) -> ChatPayload {
        ChatPayload {
            user_id: self.user_id.to_string(),
            username: self.username(),
            message: self.body.to_string(),
            timestamp: self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            message_type: self.message_type,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_wire())
    }
}

/// Request body sent to the service. The room is not part of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp: String,
    pub message_type: MessageType,
}

/// Reply from the service: an echo with `status: "OK"`, or `status: "ERROR"` with a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
}

pub const STATUS_OK: &str = "OK";
pub const STATUS_ERROR: &str = "ERROR";

impl ChatResponse {
    pub fn ok(echo: ChatPayload) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            error: None,
            server_timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            user_id: Some(echo.user_id),
            username: Some(echo.username),
            message: Some(echo.message),
            timestamp: Some(echo.timestamp),
            message_type: Some(echo.message_type),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            error: Some(reason.into()),
            server_timestamp: None,
            user_id: None,
            username: None,
            message: None,
            timestamp: None,
            message_type: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Reason string for a non-OK reply.
    pub fn reason(&self) -> &str {
        self.error.as_deref().unwrap_or(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_boundaries() {
        assert_eq!(MessageType::from_roll(0), MessageType::Text);
        assert_eq!(MessageType::from_roll(89), MessageType::Text);
        assert_eq!(MessageType::from_roll(90), MessageType::Join);
        assert_eq!(MessageType::from_roll(94), MessageType::Join);
        assert_eq!(MessageType::from_roll(95), MessageType::Leave);
        assert_eq!(MessageType::from_roll(99), MessageType::Leave);
    }

    #[test]
    fn test_wire_payload_shape() {
        let msg = ChatMessage::new(4242, "Hello everyone!", MessageType::Join, 7);
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["userId"], "4242");
        assert_eq!(value["username"], "user4242");
        assert_eq!(value["message"], "Hello everyone!");
        assert_eq!(value["messageType"], "JOIN");
        assert!(value.get("roomId").is_none());
        assert!(value.get("room").is_none());

        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok(), "bad timestamp {ts}");
    }

    #[test]
    fn test_response_decoding() {
        let ok: ChatResponse = serde_json::from_str(
            r#"{"userId":"1","username":"user1","message":"hi","timestamp":"2026-02-07T12:00:00Z",
                "messageType":"TEXT","serverTimestamp":"2026-02-07T12:00:00.010Z","status":"OK"}"#,
        )
        .unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.message_type, Some(MessageType::Text));

        let err: ChatResponse =
            serde_json::from_str(r#"{"status":"ERROR","error":"Validation failed"}"#).unwrap();
        assert!(!err.is_ok());
        assert_eq!(err.reason(), "Validation failed");
    }
}
