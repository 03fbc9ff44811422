//! NotificationService - `notification.commands` の SendNotification を送る

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, Span};

use crate::app::builder::{BuildError, ConsumerApp, ConsumerAppBuilder};
use crate::domain::contracts::SendNotification;
use crate::domain::errors::HandlerError;
use crate::ports::NotificationSender;
use crate::topology::{queues, services};
use crate::typed::{Contract, Handler, MessageContext};

#[derive(Clone)]
pub struct NotificationService {
    sender: Arc<dyn NotificationSender>,
    span: Span,
}

impl NotificationService {
    pub fn new(sender: Arc<dyn NotificationSender>, span: Span) -> Self {
        Self { sender, span }
    }

    pub fn consumer_app(self) -> Result<ConsumerApp, BuildError> {
        Ok(
            ConsumerAppBuilder::new(services::NOTIFICATION, queues::NOTIFICATION_COMMANDS)
                .register::<SendNotification, _>(self)?
                .expect_contracts(&[SendNotification::TYPE])
                .build()?,
        )
    }
}

#[async_trait]
impl Handler<SendNotification> for NotificationService {
    async fn handle(&self, command: SendNotification, ctx: &MessageContext) -> Result<(), HandlerError> {
        let span = self.span.clone();
        async {
            self.sender.send(&command).await.inspect_err(|e| {
                tracing::warn!(
                    message_id = %command.message_id,
                    kind = ?command.kind,
                    attempt = ctx.attempt,
                    error = %e,
                    "notification not sent"
                );
            })?;
            Ok::<(), HandlerError>(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contracts::NotificationKind;
    use crate::domain::envelope::BrokerMessage;
    use crate::domain::ids::{MessageId, OutboxEntryId};
    use crate::impls::LoggingNotificationSender;
    use crate::ports::ChannelError;
    use chrono::Utc;
    use ulid::Ulid;

    struct Refusing;

    #[async_trait]
    impl NotificationSender for Refusing {
        async fn send(&self, _: &SendNotification) -> Result<(), ChannelError> {
            Err(ChannelError::Refused("unsubscribed".into()))
        }
    }

    fn command() -> (SendNotification, MessageContext) {
        let command = SendNotification {
            message_id: MessageId::from_ulid(Ulid::new()),
            recipient: "bob".into(),
            originator: "alice".into(),
            kind: NotificationKind::DeliveryCompleted,
            text: "delivered".into(),
        };
        let message = BrokerMessage {
            message_id: OutboxEntryId::from_ulid(Ulid::new()),
            event_type: SendNotification::TYPE.into(),
            correlation_id: command.message_id,
            occurred_at: Utc::now(),
            payload: serde_json::to_value(&command).unwrap(),
        };
        let ctx = MessageContext::new(&message, queues::NOTIFICATION_COMMANDS, 1);
        (command, ctx)
    }

    #[tokio::test]
    async fn sends_through_the_sender() {
        let sender = LoggingNotificationSender::new();
        let service = NotificationService::new(Arc::new(sender.clone()), Span::none());
        let (command, ctx) = command();

        service.handle(command, &ctx).await.unwrap();

        assert_eq!(sender.sent(), 1);
    }

    #[tokio::test]
    async fn refused_notification_is_permanent() {
        let service = NotificationService::new(Arc::new(Refusing), Span::none());
        let (command, ctx) = command();

        let err = service.handle(command, &ctx).await.unwrap_err();

        assert!(matches!(err, HandlerError::Permanent(_)));
    }
}
