//! BrokerMessage - ブローカー上を流れるメッセージ（ワイヤ形式）
//!
//! relay が OutboxEntry から作り、consumer が受け取ります。
//!
//! # フィールド
//! - `message_id`: 元の OutboxEntry の id。重複 publish されても同じ値なので、
//!   consumer の冪等性キーになる
//! - `event_type`: payload のスキーマタグ
//! - `correlation_id`: 起点となった Message の id
//! - `payload`: JSON
//!
//! 配送試行回数はブローカーが管理し、ここには含めません（`Delivery::attempt()`）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StorageError;
use super::ids::{MessageId, OutboxEntryId};
use super::outbox::OutboxEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub message_id: OutboxEntryId,
    pub event_type: String,
    pub correlation_id: MessageId,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl BrokerMessage {
    pub fn from_entry(entry: &OutboxEntry) -> Result<Self, StorageError> {
        Ok(Self {
            message_id: entry.id,
            event_type: entry.event_type.clone(),
            correlation_id: entry.correlation_id,
            occurred_at: entry.created_at,
            payload: serde_json::from_str(&entry.payload)?,
        })
    }
}
