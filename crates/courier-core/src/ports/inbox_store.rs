//! InboxStore port - 受信者ごとの inbox
//!
//! 1 つの Message について、種類（`InboxEventKind`）ごとに 1 件だけ記録します。

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::contracts::{InboxEventKind, RegisterInInbox};
use crate::domain::errors::StorageError;
use crate::domain::ids::MessageId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub message_id: MessageId,
    pub recipient: String,
    pub kind: InboxEventKind,
    pub content: String,
    pub occurred_at: DateTime<Utc>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl From<RegisterInInbox> for InboxEntry {
    fn from(command: RegisterInInbox) -> Self {
        Self {
            message_id: command.message_id,
            recipient: command.recipient,
            kind: command.kind,
            content: command.content,
            occurred_at: command.occurred_at,
            extra: command.extra,
        }
    }
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// 記録したら `true`。同じ `(message_id, kind)` が既にあれば何もせず `false`
    async fn register(&self, entry: InboxEntry) -> Result<bool, StorageError>;

    /// 受信者の inbox を発生順に返す
    async fn entries_for(&self, recipient: &str) -> Result<Vec<InboxEntry>, StorageError>;
}
