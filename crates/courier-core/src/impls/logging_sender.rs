//! LoggingNotificationSender - 通知を tracing に書き出すだけの送信者
//!
//! 実際のチャネル（email / SMS / push）の代わりに使います。送った件数を数えます。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::contracts::SendNotification;
use crate::ports::{ChannelError, NotificationSender};

#[derive(Clone, Default)]
pub struct LoggingNotificationSender {
    sent: Arc<AtomicUsize>,
}

impl LoggingNotificationSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(&self, notification: &SendNotification) -> Result<(), ChannelError> {
        tracing::info!(
            message_id = %notification.message_id,
            recipient = %notification.recipient,
            kind = ?notification.kind,
            text = %notification.text,
            "notification sent"
        );
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
