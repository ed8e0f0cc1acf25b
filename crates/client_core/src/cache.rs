use std::{collections::HashMap, sync::Arc};

use shared::domain::{ChatId, ConversationSummary};
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct ConversationCache {
    rows: Arc<RwLock<HashMap<ChatId, ConversationSummary>>>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, chat_id: ChatId) -> Option<ConversationSummary> {
        self.rows.read().await.get(&chat_id).cloned()
    }

    pub async fn list(&self) -> Vec<ConversationSummary> {
        let mut rows: Vec<ConversationSummary> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| {
            let a_at = a.latest_message.as_ref().map(|m| m.sent_at);
            let b_at = b.latest_message.as_ref().map(|m| m.sent_at);
            b_at.cmp(&a_at).then(a.chat_id.cmp(&b.chat_id))
        });
        rows
    }

    pub async fn replace_all(&self, summaries: Vec<ConversationSummary>) {
        let mut rows = self.rows.write().await;
        rows.clear();
        rows.extend(summaries.into_iter().map(|row| (row.chat_id, row)));
    }

    pub async fn update<R>(
        &self,
        chat_id: ChatId,
        apply: impl FnOnce(&mut ConversationSummary) -> R,
    ) -> R {
        let mut rows = self.rows.write().await;
        let row = rows
            .entry(chat_id)
            .or_insert_with(|| ConversationSummary::new(chat_id));
        apply(row)
    }

    pub async fn clear(&self) {
        self.rows.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
}
