//! InMemoryInboxStore - 開発用の inbox

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::contracts::InboxEventKind;
use crate::domain::errors::StorageError;
use crate::domain::ids::MessageId;
use crate::ports::{InboxEntry, InboxStore};

#[derive(Clone, Default)]
pub struct InMemoryInboxStore {
    entries: Arc<Mutex<HashMap<(MessageId, InboxEventKind), InboxEntry>>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn register(&self, entry: InboxEntry) -> Result<bool, StorageError> {
        let mut entries = self.entries.lock().await;
        let key = (entry.message_id, entry.kind);
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(key, entry);
        Ok(true)
    }

    async fn entries_for(&self, recipient: &str) -> Result<Vec<InboxEntry>, StorageError> {
        let entries = self.entries.lock().await;
        let mut found: Vec<InboxEntry> = entries
            .values()
            .filter(|e| e.recipient == recipient)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.kind.cmp(&b.kind))
        });
        Ok(found)
    }
}
