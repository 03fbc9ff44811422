//! CreateMessageHandler - Message 作成コマンドの処理
//!
//! # フロー
//! 1. 入力検証（trim、必須、長さ）→ 失敗は `CreateMessageError::Invalid`
//! 2. Message（`Created`）と `EntityCreated` を載せた OutboxEntry を作る
//! 3. UnitOfWork で両方を 1 トランザクションで書く
//! 4. 途中で失敗したら rollback して `CreateMessageError::Internal`
//!
//! 呼び出し側が半端に commit された状態を見ることはありません。

use std::sync::Arc;

use thiserror::Error;
use tracing::{Instrument, Span};

use crate::domain::contracts::EntityCreated;
use crate::domain::errors::{UnitOfWorkError, ValidationError};
use crate::domain::message::{Message, NewMessage};
use crate::domain::outbox::OutboxEntry;
use crate::ports::{Clock, IdGenerator, UnitOfWork, UnitOfWorkFactory};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CreateMessageError {
    /// 呼び出し側が直せる入力エラー
    #[error("invalid request: {0}")]
    Invalid(#[from] ValidationError),

    /// トランザクション境界の誤用（プログラミングエラー）
    #[error("transaction misuse: {0}")]
    Transaction(UnitOfWorkError),

    /// それ以外の失敗。何も書かれていない
    #[error("message could not be created: {0}")]
    Internal(String),
}

pub struct CreateMessageHandler {
    uow_factory: Arc<dyn UnitOfWorkFactory>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl CreateMessageHandler {
    pub fn new(
        uow_factory: Arc<dyn UnitOfWorkFactory>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        span: Span,
    ) -> Self {
        Self {
            uow_factory,
            ids,
            clock,
            span,
        }
    }

    pub async fn handle(&self, request: NewMessage) -> Result<Message, CreateMessageError> {
        self.create(request).instrument(self.span.clone()).await
    }

    async fn create(&self, request: NewMessage) -> Result<Message, CreateMessageError> {
        let now = self.clock.now();
        let message = Message::new(self.ids.message_id(), request, now).inspect_err(|e| {
            tracing::info!(reason = %e, "create message rejected");
        })?;

        let event = EntityCreated {
            message_id: message.id,
            originator: message.originator.clone(),
            recipient: message.recipient.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
            delivery_address: message.delivery_address.clone(),
        };
        let entry = OutboxEntry::new(self.ids.outbox_entry_id(), &event, now)
            .map_err(|e| CreateMessageError::Internal(e.to_string()))?;
        let entry_id = entry.id;

        let mut uow = self.uow_factory.create();
        if let Err(err) = write(uow.as_mut(), message.clone(), entry).await {
            if uow.is_active()
                && let Err(rollback_err) = uow.rollback().await
            {
                tracing::warn!(message_id = %message.id, error = %rollback_err, "rollback failed");
            }
            tracing::error!(message_id = %message.id, error = %err, "create message failed");
            return Err(if err.is_misuse() {
                CreateMessageError::Transaction(err)
            } else {
                CreateMessageError::Internal(err.to_string())
            });
        }

        tracing::info!(
            message_id = %message.id,
            outbox_entry_id = %entry_id,
            "message created"
        );
        Ok(message)
    }
}

async fn write(
    uow: &mut dyn UnitOfWork,
    message: Message,
    entry: OutboxEntry,
) -> Result<(), UnitOfWorkError> {
    uow.begin().await?;
    uow.messages().add(message).await?;
    uow.outbox().add(entry).await?;
    uow.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageStatus;
    use crate::impls::{FaultPoint, InMemoryDatabase};
    use crate::ports::{FixedClock, MessageStore, OutboxStore, UlidGenerator};
    use chrono::{TimeZone, Utc};

    fn handler(db: &InMemoryDatabase) -> CreateMessageHandler {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        CreateMessageHandler::new(
            Arc::new(db.clone()),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            Span::none(),
        )
    }

    #[tokio::test]
    async fn creates_message_and_outbox_entry_together() {
        let db = InMemoryDatabase::new();

        let message = handler(&db)
            .handle(NewMessage::new("A", "B", "hello"))
            .await
            .unwrap();

        let stored = MessageStore::get(&db, message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Created);

        let entries = db.outbox_entries().await;
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.event_type, "EntityCreated");
        assert!(!entry.published);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.correlation_id, message.id);

        let event: EntityCreated = entry.decode().unwrap();
        assert_eq!(event.message_id, message.id);
        assert_eq!(event.content, "hello");
    }

    #[tokio::test]
    async fn blank_recipient_persists_nothing() {
        let db = InMemoryDatabase::new();

        let err = handler(&db)
            .handle(NewMessage::new("A", "   ", "hello"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CreateMessageError::Invalid(ValidationError::Required { field: "recipient" })
        );
        assert_eq!(db.message_count().await, 0);
        assert!(db.outbox_entries().await.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_rolls_back_both_writes() {
        for fault in [FaultPoint::MessageWrite, FaultPoint::OutboxWrite, FaultPoint::Commit] {
            let db = InMemoryDatabase::new();
            db.fail_next(fault);

            let err = handler(&db)
                .handle(NewMessage::new("A", "B", "hello"))
                .await
                .unwrap_err();

            assert!(matches!(err, CreateMessageError::Internal(_)), "{fault:?}");
            assert_eq!(db.message_count().await, 0, "{fault:?}");
            assert!(db.get_pending(10, Utc::now()).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn a_failed_create_does_not_poison_the_next_one() {
        let db = InMemoryDatabase::new();
        db.fail_next(FaultPoint::Commit);
        let handler = handler(&db);

        assert!(handler.handle(NewMessage::new("A", "B", "one")).await.is_err());
        let second = handler.handle(NewMessage::new("A", "B", "two")).await.unwrap();

        assert_eq!(db.message_count().await, 1);
        assert_eq!(
            MessageStore::get(&db, second.id).await,
            Ok(Some(second.clone()))
        );
    }
}
