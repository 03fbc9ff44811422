//! InMemoryIdempotencyStore - 開発用の処理済み記録
//!
//! `HashSet<(consumer, message_id)>` を Mutex で守るだけの実装です。
//! 本番ではサービスのデータベースに `(consumer, message_id)` の一意制約付きテーブルを置きます。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::StorageError;
use crate::domain::ids::OutboxEntryId;
use crate::ports::IdempotencyStore;

#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    processed: Arc<Mutex<HashSet<(String, OutboxEntryId)>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.processed.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processed.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_processed(
        &self,
        consumer: &str,
        message_id: OutboxEntryId,
    ) -> Result<bool, StorageError> {
        let processed = self.processed.lock().await;
        Ok(processed.contains(&(consumer.to_string(), message_id)))
    }

    async fn mark_processed(
        &self,
        consumer: &str,
        message_id: OutboxEntryId,
    ) -> Result<(), StorageError> {
        self.processed
            .lock()
            .await
            .insert((consumer.to_string(), message_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn keys_are_scoped_per_consumer() {
        let store = InMemoryIdempotencyStore::new();
        let id = OutboxEntryId::from_ulid(Ulid::new());

        store.mark_processed("inbox", id).await.unwrap();
        store.mark_processed("inbox", id).await.unwrap();

        assert!(store.is_processed("inbox", id).await.unwrap());
        assert!(!store.is_processed("notification", id).await.unwrap());
        assert_eq!(store.len().await, 1);
    }
}
