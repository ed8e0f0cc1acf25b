use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ChatId, ChatMessage, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlFrame {
    Typing {
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<ChatId>,
    },
    StopTyping {
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<ChatId>,
    },
    HasBeenBlocked {
        sender_id: UserId,
    },
    HasBeenUnblocked {
        sender_id: UserId,
    },
    Reading {
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<ChatId>,
    },
    Delete {
        message_id: MessageId,
    },
    Edit {
        message_id: MessageId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edited_at: Option<DateTime<Utc>>,
    },
    EndCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
}

const KNOWN_COMMANDS: &[&str] = &[
    "TYPING",
    "STOP_TYPING",
    "HAS_BEEN_BLOCKED",
    "HAS_BEEN_UNBLOCKED",
    "READING",
    "DELETE",
    "EDIT",
    "END_CALL",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    NewMessage(ChatMessage),
    Typing {
        sender_id: UserId,
    },
    StopTyping {
        sender_id: UserId,
    },
    Blocked {
        sender_id: UserId,
    },
    Unblocked {
        sender_id: UserId,
    },
    ReadReceipt {
        reader_id: UserId,
    },
    Deleted {
        message_id: MessageId,
    },
    Edited {
        message_id: MessageId,
        content: String,
        edited_at: Option<DateTime<Utc>>,
    },
    CallEnded {
        sender_id: Option<UserId>,
        call_id: Option<String>,
    },
    Unrecognized {
        command: String,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame body must be a json object")]
    NotAnObject,
    #[error("malformed {kind} frame: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundFrame {
    pub fn parse(payload: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value =
            serde_json::from_str(payload).map_err(FrameError::InvalidJson)?;
        let Some(object) = value.as_object() else {
            return Err(FrameError::NotAnObject);
        };

        let command = match object.get("command") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(command)) => Some(command.clone()),
            Some(other) => Some(other.to_string()),
        };

        let Some(command) = command else {
            let message: ChatMessage =
                serde_json::from_value(value).map_err(|source| FrameError::Malformed {
                    kind: "message".to_string(),
                    source,
                })?;
            return Ok(Self::NewMessage(message));
        };

        if !KNOWN_COMMANDS.contains(&command.as_str()) {
            return Ok(Self::Unrecognized { command });
        }

        let control: ControlFrame =
            serde_json::from_value(value).map_err(|source| FrameError::Malformed {
                kind: command.clone(),
                source,
            })?;
        Ok(control.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stop_typing",
            Self::Blocked { .. } => "blocked",
            Self::Unblocked { .. } => "unblocked",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::Deleted { .. } => "deleted",
            Self::Edited { .. } => "edited",
            Self::CallEnded { .. } => "call_ended",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

impl From<ControlFrame> for InboundFrame {
    fn from(value: ControlFrame) -> Self {
        match value {
            ControlFrame::Typing { sender_id, .. } => Self::Typing { sender_id },
            ControlFrame::StopTyping { sender_id, .. } => Self::StopTyping { sender_id },
            ControlFrame::HasBeenBlocked { sender_id } => Self::Blocked { sender_id },
            ControlFrame::HasBeenUnblocked { sender_id } => Self::Unblocked { sender_id },
            ControlFrame::Reading { sender_id, .. } => Self::ReadReceipt {
                reader_id: sender_id,
            },
            ControlFrame::Delete { message_id } => Self::Deleted { message_id },
            ControlFrame::Edit {
                message_id,
                content,
                edited_at,
            } => Self::Edited {
                message_id,
                content,
                edited_at,
            },
            ControlFrame::EndCall { sender_id, call_id } => Self::CallEnded { sender_id, call_id },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user_id: UserId,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub has_more: bool,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
