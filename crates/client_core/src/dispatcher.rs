use std::{collections::HashSet, sync::Arc};

use shared::{
    domain::{BlockStatus, ChatId, ChatMessage, MessageId, UserId},
    protocol::InboundFrame,
};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use crate::{cache::ConversationCache, connection::PushMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    PeerTyping {
        chat_id: ChatId,
        typing: bool,
    },
    BlockChanged {
        chat_id: ChatId,
        status: BlockStatus,
    },
    MessagesRead {
        chat_id: ChatId,
    },
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
    },
    MessageEdited {
        chat_id: ChatId,
        message_id: MessageId,
    },
    MessageReceived {
        chat_id: ChatId,
        message_id: MessageId,
    },
    CallEnded {
        chat_id: ChatId,
        call_id: Option<String>,
    },
}

#[derive(Default)]
struct ChatState {
    // Newest first.
    messages: Vec<ChatMessage>,
    peer_typing: bool,
}

#[derive(Clone)]
pub struct ChatDispatcher {
    chat_id: ChatId,
    viewer: UserId,
    state: Arc<RwLock<ChatState>>,
    cache: ConversationCache,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatDispatcher {
    pub fn new(chat_id: ChatId, viewer: UserId, cache: ConversationCache) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            chat_id,
            viewer,
            state: Arc::new(RwLock::new(ChatState::default())),
            cache,
            events,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.read().await.messages.clone()
    }

    pub async fn peer_typing(&self) -> bool {
        self.state.read().await.peer_typing
    }

    pub async fn merge_history(&self, page: Vec<ChatMessage>) -> usize {
        let mut state = self.state.write().await;
        let mut known: HashSet<MessageId> = state.messages.iter().map(|m| m.id).collect();
        let before = state.messages.len();
        for message in page {
            if known.insert(message.id) {
                state.messages.push(message);
            }
        }
        state.messages.len() - before
    }

    pub async fn mark_read_locally(&self) {
        self.cache
            .update(self.chat_id, |row| row.unread_count = 0)
            .await;
    }

    pub async fn run(&self, mut frames: mpsc::UnboundedReceiver<PushMessage>) {
        while let Some(frame) = frames.recv().await {
            self.dispatch(&frame.body).await;
        }
        debug!(chat_id = %self.chat_id, "dispatch: subscription closed");
    }

    pub async fn dispatch(&self, payload: &str) -> Option<ChatEvent> {
        let frame = match InboundFrame::parse(payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(chat_id = %self.chat_id, "dispatch: dropping frame: {err}");
                return None;
            }
        };
        let event = self.apply(frame).await?;
        let _ = self.events.send(event.clone());
        Some(event)
    }

    async fn apply(&self, frame: InboundFrame) -> Option<ChatEvent> {
        let chat_id = self.chat_id;
        match frame {
            InboundFrame::Typing { sender_id } => self.set_typing(sender_id, true).await,
            InboundFrame::StopTyping { sender_id } => self.set_typing(sender_id, false).await,
            InboundFrame::Blocked { sender_id } => {
                let status = if sender_id == self.viewer {
                    BlockStatus::Blocked
                } else {
                    BlockStatus::HasBeenBlocked
                };
                self.set_block_status(status).await
            }
            InboundFrame::Unblocked { .. } => self.set_block_status(BlockStatus::Normal).await,
            InboundFrame::ReadReceipt { reader_id } => {
                if reader_id == self.viewer {
                    return None;
                }
                let mut state = self.state.write().await;
                for message in &mut state.messages {
                    message.is_read = true;
                }
                Some(ChatEvent::MessagesRead { chat_id })
            }
            InboundFrame::Deleted { message_id } => {
                let mut state = self.state.write().await;
                let message = state.messages.iter_mut().find(|m| m.id == message_id)?;
                message.tombstone();
                Some(ChatEvent::MessageDeleted {
                    chat_id,
                    message_id,
                })
            }
            InboundFrame::Edited {
                message_id,
                content,
                edited_at,
            } => {
                let mut state = self.state.write().await;
                let message = state.messages.iter_mut().find(|m| m.id == message_id)?;
                message.apply_edit(content, edited_at.unwrap_or_else(chrono::Utc::now));
                Some(ChatEvent::MessageEdited {
                    chat_id,
                    message_id,
                })
            }
            InboundFrame::NewMessage(message) => Some(self.receive(message).await),
            InboundFrame::CallEnded { call_id, .. } => Some(ChatEvent::CallEnded { chat_id, call_id }),
            InboundFrame::Unrecognized { command } => {
                debug!(%chat_id, %command, "dispatch: ignoring unrecognized command");
                None
            }
        }
    }

    async fn set_typing(&self, sender_id: UserId, typing: bool) -> Option<ChatEvent> {
        // Our own typing signal echoed back by the broker.
        if sender_id == self.viewer {
            return None;
        }
        self.state.write().await.peer_typing = typing;
        Some(ChatEvent::PeerTyping {
            chat_id: self.chat_id,
            typing,
        })
    }

    async fn set_block_status(&self, status: BlockStatus) -> Option<ChatEvent> {
        self.cache
            .update(self.chat_id, |row| row.block_status = status)
            .await;
        Some(ChatEvent::BlockChanged {
            chat_id: self.chat_id,
            status,
        })
    }

    async fn receive(&self, message: ChatMessage) -> ChatEvent {
        let message_id = message.id;
        {
            let mut state = self.state.write().await;
            state.peer_typing = false;
            let own_echo = message.sender.id == self.viewer
                && state.messages.iter().any(|m| m.id == message_id);
            if !own_echo {
                state.messages.insert(0, message.clone());
            }
        }
        self.cache
            .update(self.chat_id, |row| {
                row.latest_message = Some(message);
                row.unread_count += 1;
            })
            .await;
        ChatEvent::MessageReceived {
            chat_id: self.chat_id,
            message_id,
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
