//! Channel ports - 外部の配送手段と通知手段
//!
//! 具体的なチャネル（email / SMS / push など）はこのクレートの外にあります。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::contracts::{EntityCreated, SendNotification};
use crate::domain::errors::HandlerError;

/// ChannelError は外部チャネル呼び出しの失敗
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// 一時的に使えない（タイムアウト、接続断など）
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// 入力が受け付けられない
    #[error("channel refused the request: {0}")]
    Refused(String),
}

impl From<ChannelError> for HandlerError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Unavailable(_) => HandlerError::Retryable(err.to_string()),
            ChannelError::Refused(_) => HandlerError::Permanent(err.to_string()),
        }
    }
}

/// 配送の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered { notes: Option<String> },
    /// 配送できなかった（宛先不明など）。再試行しても結果は変わらない
    Undeliverable { reason: String },
}

/// DeliveryChannel は Message を宛先に届ける
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, message: &EntityCreated) -> Result<DeliveryReport, ChannelError>;
}

/// NotificationSender は通知を送る
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &SendNotification) -> Result<(), ChannelError>;
}
