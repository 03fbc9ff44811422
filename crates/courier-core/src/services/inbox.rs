//! InboxService - `inbox.commands` の RegisterInInbox を recipient の inbox に記録する
//!
//! `(message_id, kind)` ごとに 1 件。同じ登録が再配送されても何もしません。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, Span};

use crate::app::builder::{BuildError, ConsumerApp, ConsumerAppBuilder};
use crate::domain::contracts::RegisterInInbox;
use crate::domain::errors::HandlerError;
use crate::ports::{InboxEntry, InboxStore};
use crate::topology::{queues, services};
use crate::typed::{Contract, Handler, MessageContext};

#[derive(Clone)]
pub struct InboxService {
    store: Arc<dyn InboxStore>,
    span: Span,
}

impl InboxService {
    pub fn new(store: Arc<dyn InboxStore>, span: Span) -> Self {
        Self { store, span }
    }

    pub fn consumer_app(self) -> Result<ConsumerApp, BuildError> {
        Ok(ConsumerAppBuilder::new(services::INBOX, queues::INBOX_COMMANDS)
            .register::<RegisterInInbox, _>(self)?
            .expect_contracts(&[RegisterInInbox::TYPE])
            .build()?)
    }
}

#[async_trait]
impl Handler<RegisterInInbox> for InboxService {
    async fn handle(&self, command: RegisterInInbox, _: &MessageContext) -> Result<(), HandlerError> {
        let span = self.span.clone();
        async {
            let message_id = command.message_id;
            let kind = command.kind;
            let recipient = command.recipient.clone();
            if self.store.register(InboxEntry::from(command)).await? {
                tracing::info!(%message_id, ?kind, %recipient, "inbox entry registered");
            } else {
                tracing::debug!(%message_id, ?kind, "inbox entry already registered");
            }
            Ok::<(), HandlerError>(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contracts::InboxEventKind;
    use crate::domain::envelope::BrokerMessage;
    use crate::domain::ids::{MessageId, OutboxEntryId};
    use crate::impls::InMemoryInboxStore;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use ulid::Ulid;

    fn register(message_id: MessageId, kind: InboxEventKind) -> (RegisterInInbox, MessageContext) {
        let command = RegisterInInbox {
            message_id,
            recipient: "bob".into(),
            kind,
            content: "hello".into(),
            occurred_at: Utc::now(),
            extra: BTreeMap::new(),
        };
        let message = BrokerMessage {
            message_id: OutboxEntryId::from_ulid(Ulid::new()),
            event_type: RegisterInInbox::TYPE.into(),
            correlation_id: message_id,
            occurred_at: command.occurred_at,
            payload: serde_json::to_value(&command).unwrap(),
        };
        let ctx = MessageContext::new(&message, queues::INBOX_COMMANDS, 1);
        (command, ctx)
    }

    #[tokio::test]
    async fn re_registration_is_a_no_op() {
        let store = InMemoryInboxStore::new();
        let service = InboxService::new(Arc::new(store.clone()), Span::none());
        let id = MessageId::from_ulid(Ulid::new());

        let (command, ctx) = register(id, InboxEventKind::DeliveryCompleted);
        service.handle(command.clone(), &ctx).await.unwrap();
        service.handle(command, &ctx).await.unwrap();
        let (other_kind, ctx) = register(id, InboxEventKind::MessageReceived);
        service.handle(other_kind, &ctx).await.unwrap();

        let entries = store.entries_for("bob").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn consumer_app_reads_the_inbox_queue() {
        let app = InboxService::new(Arc::new(InMemoryInboxStore::new()), Span::none())
            .consumer_app()
            .unwrap();

        assert_eq!(app.name(), services::INBOX);
        assert_eq!(app.queue(), queues::INBOX_COMMANDS);
    }
}
