//! Contracts - サービス間のワイヤ契約（event / command ペイロード）
//!
//! # Events（fan-out exchange 経由）
//! - [`EntityCreated`]: dispatch が Message を作成した
//! - [`DeliveryCompleted`] / [`DeliveryFailed`]: delivery の結果
//!
//! # Commands（point-to-point queue 経由）
//! - [`SendNotification`]: notification サービスへの通知依頼
//! - [`RegisterInInbox`]: inbox サービスへの記録依頼

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::MessageId;
use crate::typed::Contract;

/// Message が作成されたことを表す event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCreated {
    pub message_id: MessageId,
    pub originator: String,
    pub recipient: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_address: Option<String>,
}

impl Contract for EntityCreated {
    const TYPE: &'static str = "EntityCreated";

    fn correlation_id(&self) -> MessageId {
        self.message_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCompleted {
    pub message_id: MessageId,
    pub recipient: String,
    pub delivered_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Contract for DeliveryCompleted {
    const TYPE: &'static str = "DeliveryCompleted";

    fn correlation_id(&self) -> MessageId {
        self.message_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailed {
    pub message_id: MessageId,
    pub recipient: String,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    /// delivery 側で行った試行回数
    pub attempts: u32,
    #[serde(default)]
    pub should_retry: bool,
}

impl Contract for DeliveryFailed {
    const TYPE: &'static str = "DeliveryFailed";

    fn correlation_id(&self) -> MessageId {
        self.message_id
    }
}

/// 通知の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    MessageCreated,
    DeliveryCompleted,
    DeliveryFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendNotification {
    pub message_id: MessageId,
    pub recipient: String,
    pub originator: String,
    pub kind: NotificationKind,
    pub text: String,
}

impl Contract for SendNotification {
    const TYPE: &'static str = "SendNotification";

    fn correlation_id(&self) -> MessageId {
        self.message_id
    }
}

/// inbox に記録するイベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InboxEventKind {
    MessageReceived,
    DeliveryStarted,
    DeliveryCompleted,
    DeliveryFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterInInbox {
    pub message_id: MessageId,
    pub recipient: String,
    pub kind: InboxEventKind,
    pub content: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Contract for RegisterInInbox {
    const TYPE: &'static str = "RegisterInInbox";

    fn correlation_id(&self) -> MessageId {
        self.message_id
    }
}
