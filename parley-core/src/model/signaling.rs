use crate::model::peer::PeerId;
use crate::model::room::RoomId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One WebSocket frame: `{"type": "...", "payload": {...}}`. The payload is
/// left opaque until the type has been matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_owned(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Client → server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayload {
    pub username: String,
    pub channel_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinPayload {
    pub username: String,
    pub channel_name: String,
    pub password: String,
    pub invite_token: String,
    pub session_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub sdp: String,
    pub seq: u64,
    pub epoch: u64,
}

/// Trickle ICE, both directions. `sdpMLineIndex` may legitimately be null.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    pub seq: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub ciphertext: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutePayload {
    pub muted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubInvitePayload {
    pub target_user_id: PeerId,
    #[serde(default)]
    pub channel_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubResponsePayload {
    pub invite_id: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToSubPayload {
    pub sub_channel_id: RoomId,
}

// ---------------------------------------------------------------------------
// Server → client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: PeerId,
    pub name: String,
    pub muted: bool,
    pub in_sub_channel: Option<RoomId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubChannelInfo {
    pub id: RoomId,
    pub name: String,
    pub users: Vec<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageOut {
    pub id: String,
    pub user_id: PeerId,
    pub user_name: String,
    pub ciphertext: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<RoomId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatePayload {
    pub id: RoomId,
    pub name: String,
    pub full_name: String,
    pub current_channel_id: RoomId,
    pub users: Vec<UserInfo>,
    pub sub_channels: Vec<SubChannelInfo>,
    pub chat_history: Vec<ChatMessageOut>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub user_id: PeerId,
    pub session_token: String,
    pub invite_token: String,
    pub room_state: RoomStatePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdatePayload {
    pub users: Vec<UserInfo>,
    pub sub_channels: Vec<SubChannelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: String,
    pub reset: bool,
    pub seq: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryPayload {
    pub channel_id: RoomId,
    pub messages: Vec<ChatMessageOut>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteReqPayload {
    pub invite_id: String,
    pub from_user_id: PeerId,
    pub from_name: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteExpiredReason {
    Timeout,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteExpiredPayload {
    pub invite_id: String,
    pub reason: InviteExpiredReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Protocol error codes. The string forms are a contract with clients and
/// must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    PasswordRequired,
    PasswordWrong,
    ChannelFull,
    ServerFull,
    NameTaken,
    ChannelNotFound,
    AlreadyInSub,
    InviteExpired,
    InvalidMessage,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::PasswordRequired => "PASSWORD_REQUIRED",
            ErrorCode::PasswordWrong => "PASSWORD_WRONG",
            ErrorCode::ChannelFull => "CHANNEL_FULL",
            ErrorCode::ServerFull => "SERVER_FULL",
            ErrorCode::NameTaken => "NAME_TAKEN",
            ErrorCode::ChannelNotFound => "CHANNEL_NOT_FOUND",
            ErrorCode::AlreadyInSub => "ALREADY_IN_SUB",
            ErrorCode::InviteExpired => "INVITE_EXPIRED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_to_stable_strings() {
        let json = serde_json::to_string(&ErrorCode::PasswordWrong).unwrap();
        assert_eq!(json, "\"PASSWORD_WRONG\"");
        assert_eq!(ErrorCode::AlreadyInSub.as_str(), "ALREADY_IN_SUB");
    }

    #[test]
    fn candidate_payload_field_names_match_the_wire() {
        let payload = CandidatePayload {
            candidate: "candidate:1 1 udp 1 127.0.0.1 4444 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: None,
            seq: 2,
            epoch: 1,
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert!(v.get("sdpMid").is_some());
        assert!(v.get("sdpMLineIndex").is_some());
        assert_eq!(v["seq"], 2);
    }

    #[test]
    fn join_payload_tolerates_missing_fields() {
        let p: JoinPayload = serde_json::from_str(r#"{"username":"a"}"#).unwrap();
        assert_eq!(p.username, "a");
        assert!(p.session_token.is_empty());
        assert!(p.invite_token.is_empty());
    }

    #[test]
    fn envelope_round_trips_with_opaque_payload() {
        let env: Envelope =
            serde_json::from_str(r#"{"type":"chat","payload":{"ciphertext":"abc"}}"#).unwrap();
        assert_eq!(env.kind, "chat");
        let chat: ChatPayload = serde_json::from_value(env.payload).unwrap();
        assert_eq!(chat.ciphertext, "abc");
    }
}
