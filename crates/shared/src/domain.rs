use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);

pub const TOMBSTONE_CONTENT: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    #[default]
    Normal,
    Blocked,
    HasBeenBlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Call,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub sender: Sender,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn tombstone(&mut self) {
        self.content = TOMBSTONE_CONTENT.to_string();
        self.deleted = true;
    }

    pub fn apply_edit(&mut self, content: String, edited_at: DateTime<Utc>) {
        self.content = content;
        self.edited = true;
        self.edited_at = Some(edited_at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<ChatMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub block_status: BlockStatus,
}

impl ConversationSummary {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            latest_message: None,
            unread_count: 0,
            block_status: BlockStatus::Normal,
        }
    }
}

pub fn chat_destination(chat_id: ChatId) -> String {
    format!("/topic/chat/{chat_id}")
}

pub fn user_notification_destination(user_id: UserId) -> String {
    format!("/user/{user_id}/queue/notifications")
}

pub fn chat_publish_destination(chat_id: ChatId) -> String {
    format!("/app/chat/{chat_id}")
}
