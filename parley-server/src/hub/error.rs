use parley_core::ErrorCode;
use thiserror::Error;

/// Hub-level failures, carried as a structured `(code, message)` pair. The
/// code is the stable protocol string sent in error envelopes; the display
/// text is the human-readable half.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Server has reached the maximum number of rooms")]
    ServerFull,
    #[error("Too many rooms created recently, try again later")]
    CreateRateLimited,
    #[error("Room not found")]
    ChannelNotFound,
    #[error("Invite link has expired")]
    InviteExpired,
    #[error("Password is required")]
    PasswordRequired,
    #[error("Invalid password")]
    PasswordWrong,
    #[error("Room is full")]
    ChannelFull,
    #[error("Username already taken in this room")]
    NameTaken,
    #[error("Cannot join sub-channel directly")]
    CannotJoinSubDirectly,
    #[error("Must provide channelName, inviteToken, or sessionToken")]
    MissingJoinCredentials,
    #[error("{0}")]
    Internal(String),
}

impl HubError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::ServerFull | HubError::CreateRateLimited => ErrorCode::ServerFull,
            HubError::ChannelNotFound => ErrorCode::ChannelNotFound,
            HubError::InviteExpired => ErrorCode::InviteExpired,
            HubError::PasswordRequired => ErrorCode::PasswordRequired,
            HubError::PasswordWrong => ErrorCode::PasswordWrong,
            HubError::ChannelFull => ErrorCode::ChannelFull,
            HubError::NameTaken => ErrorCode::NameTaken,
            HubError::CannotJoinSubDirectly | HubError::MissingJoinCredentials => {
                ErrorCode::InvalidMessage
            }
            HubError::Internal(_) => ErrorCode::InternalError,
        }
    }
}
