//! DispatchStatusProjection - 配送結果を dispatch 側の Message 状態に反映する
//!
//! `dispatch.delivery.events` を読み、`Created → InProgress → Delivered / Failed` と進めます。
//! 終端状態は変わらず、最後の更新より古いイベントは捨てます（重複・順序入れ替わり対策）。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Instrument, Span};

use crate::app::builder::{BuildError, ConsumerApp, ConsumerAppBuilder};
use crate::domain::contracts::{DeliveryCompleted, DeliveryFailed};
use crate::domain::errors::HandlerError;
use crate::domain::ids::MessageId;
use crate::domain::message::{MessageStatus, StatusChange};
use crate::ports::MessageStore;
use crate::topology::{exchanges, services, subscriber_queue};
use crate::typed::{Contract, Handler, MessageContext};

#[derive(Clone)]
pub struct DispatchStatusProjection {
    messages: Arc<dyn MessageStore>,
    span: Span,
}

impl DispatchStatusProjection {
    pub fn new(messages: Arc<dyn MessageStore>, span: Span) -> Self {
        Self { messages, span }
    }

    /// `dispatch.delivery.events` を読む consumer を作る
    pub fn consumer_app(self) -> Result<ConsumerApp, BuildError> {
        Ok(ConsumerAppBuilder::new(
            services::DISPATCH,
            subscriber_queue(services::DISPATCH, exchanges::DELIVERY_EVENTS),
        )
        .register::<DeliveryCompleted, _>(self.clone())?
        .register::<DeliveryFailed, _>(self)?
        .expect_contracts(&[DeliveryCompleted::TYPE, DeliveryFailed::TYPE])
        .build()?)
    }

    async fn apply(
        &self,
        id: MessageId,
        target: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<(), HandlerError> {
        let Some(mut message) = self.messages.get(id).await? else {
            // Message の commit 後にしか event は出ないので、ここに来るのはデータの不整合
            return Err(HandlerError::permanent(format!("unknown message {id}")));
        };

        match message.advance_to(target, at) {
            StatusChange::Applied { from, to } => {
                self.messages.update(message).await?;
                tracing::info!(message_id = %id, ?from, ?to, "message status updated");
            }
            StatusChange::Ignored => {
                tracing::debug!(message_id = %id, status = ?message.status, ?target, "status event ignored");
            }
            StatusChange::Stale => {
                tracing::debug!(message_id = %id, at = %at, "stale status event dropped");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<DeliveryCompleted> for DispatchStatusProjection {
    async fn handle(&self, event: DeliveryCompleted, _: &MessageContext) -> Result<(), HandlerError> {
        self.apply(event.message_id, MessageStatus::Delivered, event.delivered_at)
            .instrument(self.span.clone())
            .await
    }
}

#[async_trait]
impl Handler<DeliveryFailed> for DispatchStatusProjection {
    async fn handle(&self, event: DeliveryFailed, _: &MessageContext) -> Result<(), HandlerError> {
        self.apply(event.message_id, MessageStatus::Failed, event.failed_at)
            .instrument(self.span.clone())
            .await
    }
}
