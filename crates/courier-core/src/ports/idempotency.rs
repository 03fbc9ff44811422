//! IdempotencyStore port - consumer ごとの処理済みメッセージの記録
//!
//! キーは `(consumer, message_id)`。`message_id` は元の OutboxEntry の id なので、
//! relay が同じエントリを 2 回 publish しても同じキーになります。

use async_trait::async_trait;

use crate::domain::errors::StorageError;
use crate::domain::ids::OutboxEntryId;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_processed(
        &self,
        consumer: &str,
        message_id: OutboxEntryId,
    ) -> Result<bool, StorageError>;

    /// 既に記録済みなら何もしない
    async fn mark_processed(
        &self,
        consumer: &str,
        message_id: OutboxEntryId,
    ) -> Result<(), StorageError>;
}
