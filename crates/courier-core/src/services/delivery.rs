//! DeliveryService - EntityCreated を受けて配送し、結果を自分の outbox に書く
//!
//! # フロー
//! 1. `DeliveryChannel::deliver()` を呼ぶ
//! 2. 結果を `DeliveryCompleted` / `DeliveryFailed` にする
//! 3. 1 つの UnitOfWork で次の 3 件を outbox に追加して commit
//!    - 結果 event（`delivery.events` へ）
//!    - `SendNotification`（originator への通知）
//!    - `RegisterInInbox`（recipient の inbox）
//!
//! # 失敗の扱い
//! - チャネルが一時的に使えない → Retryable（ブローカーが再配送）
//! - ただし最後の試行なら `DeliveryFailed` として記録して ack させる
//! - チャネルが拒否した → Permanent（DLQ）
//! - outbox の書き込み失敗 → rollback して Retryable
//!
//! # 重複配送
//! 追加する 3 件の id は入力の message_id から決まる（[`crate::domain::ids::Id::derive`]）。
//! 同じ EntityCreated を 2 回処理しても 2 回目の書き込みは `StorageError::Conflict` になり、
//! 既に記録済みとして成功扱いにします。並行に処理された場合も先に commit した方だけが残ります。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{Instrument, Span};

use crate::app::builder::{BuildError, ConsumerApp, ConsumerAppBuilder};
use crate::domain::contracts::{
    DeliveryCompleted, DeliveryFailed, EntityCreated, InboxEventKind, NotificationKind,
    RegisterInInbox, SendNotification,
};
use crate::domain::errors::{HandlerError, StorageError, UnitOfWorkError};
use crate::domain::ids::OutboxEntryId;
use crate::domain::outbox::OutboxEntry;
use crate::ports::{
    ChannelError, Clock, DeliveryChannel, DeliveryReport, UnitOfWork, UnitOfWorkFactory,
};
use crate::topology::{exchanges, services, subscriber_queue, MAX_ATTEMPTS};
use crate::typed::{Contract, Handler, MessageContext};

/// 入力 1 件から作る outbox エントリの役割。id の導出に使う
const RESULT_SALT: &str = "delivery.result";
const NOTIFICATION_SALT: &str = "delivery.notification";
const INBOX_SALT: &str = "delivery.inbox";

/// 配送結果
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Completed(DeliveryCompleted),
    Failed(DeliveryFailed),
}

#[derive(Clone)]
pub struct DeliveryService {
    channel: Arc<dyn DeliveryChannel>,
    uow_factory: Arc<dyn UnitOfWorkFactory>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl DeliveryService {
    pub fn new(
        channel: Arc<dyn DeliveryChannel>,
        uow_factory: Arc<dyn UnitOfWorkFactory>,
        clock: Arc<dyn Clock>,
        span: Span,
    ) -> Self {
        Self {
            channel,
            uow_factory,
            clock,
            span,
        }
    }

    /// `delivery.message.events` を読む consumer を作る
    pub fn consumer_app(self) -> Result<ConsumerApp, BuildError> {
        Ok(ConsumerAppBuilder::new(
            services::DELIVERY,
            subscriber_queue(services::DELIVERY, exchanges::MESSAGE_EVENTS),
        )
        .register::<EntityCreated, _>(self)?
        .expect_contracts(&[EntityCreated::TYPE])
        .build()?)
    }

    async fn deliver(&self, event: EntityCreated, ctx: &MessageContext) -> Result<(), HandlerError> {
        tracing::info!(
            message_id = %event.message_id,
            recipient = %event.recipient,
            attempt = ctx.attempt,
            "delivery started"
        );

        let report = self.channel.deliver(&event).await;
        let now = self.clock.now();
        let outcome = match report {
            Ok(DeliveryReport::Delivered { notes }) => Outcome::Completed(DeliveryCompleted {
                message_id: event.message_id,
                recipient: event.recipient.clone(),
                delivered_at: now,
                notes,
            }),
            Ok(DeliveryReport::Undeliverable { reason }) => {
                Outcome::Failed(failed(&event, reason, ctx.attempt, now))
            }
            Err(ChannelError::Unavailable(reason)) if ctx.attempt >= MAX_ATTEMPTS => {
                tracing::warn!(
                    message_id = %event.message_id,
                    attempt = ctx.attempt,
                    error = %reason,
                    "delivery channel still unavailable on the last attempt"
                );
                Outcome::Failed(failed(&event, reason, ctx.attempt, now))
            }
            Err(e) => return Err(e.into()),
        };

        let entries = outbox_entries(ctx.message_id, &event, &outcome, now)?;
        let mut uow = self.uow_factory.create();
        if let Err(err) = write(uow.as_mut(), entries).await {
            if uow.is_active()
                && let Err(rollback_err) = uow.rollback().await
            {
                tracing::warn!(message_id = %event.message_id, error = %rollback_err, "rollback failed");
            }
            if matches!(err, UnitOfWorkError::Storage(StorageError::Conflict(_))) {
                tracing::info!(
                    message_id = %event.message_id,
                    source = %ctx.message_id,
                    "delivery outcome already recorded"
                );
                return Ok(());
            }
            tracing::error!(message_id = %event.message_id, error = %err, "failed to record delivery outcome");
            return Err(err.into());
        }

        match &outcome {
            Outcome::Completed(_) => {
                tracing::info!(message_id = %event.message_id, "message delivered");
            }
            Outcome::Failed(f) => {
                tracing::warn!(message_id = %event.message_id, reason = %f.reason, "message undeliverable");
            }
        }
        Ok(())
    }
}

fn outbox_entries(
    source: OutboxEntryId,
    event: &EntityCreated,
    outcome: &Outcome,
    now: DateTime<Utc>,
) -> Result<Vec<OutboxEntry>, StorageError> {
    let result_id: OutboxEntryId = source.derive(RESULT_SALT);
    let (result, notification, inbox) = match outcome {
        Outcome::Completed(completed) => (
            OutboxEntry::new(result_id, completed, now)?,
            SendNotification {
                message_id: event.message_id,
                recipient: event.recipient.clone(),
                originator: event.originator.clone(),
                kind: NotificationKind::DeliveryCompleted,
                text: format!("Your message to {} was delivered.", event.recipient),
            },
            RegisterInInbox {
                message_id: event.message_id,
                recipient: event.recipient.clone(),
                kind: InboxEventKind::DeliveryCompleted,
                content: event.content.clone(),
                occurred_at: completed.delivered_at,
                extra: completed
                    .notes
                    .iter()
                    .map(|notes| ("notes".to_string(), json!(notes)))
                    .collect(),
            },
        ),
        Outcome::Failed(failed) => (
            OutboxEntry::new(result_id, failed, now)?,
            SendNotification {
                message_id: event.message_id,
                recipient: event.recipient.clone(),
                originator: event.originator.clone(),
                kind: NotificationKind::DeliveryFailed,
                text: format!(
                    "Your message to {} could not be delivered: {}",
                    event.recipient, failed.reason
                ),
            },
            RegisterInInbox {
                message_id: event.message_id,
                recipient: event.recipient.clone(),
                kind: InboxEventKind::DeliveryFailed,
                content: event.content.clone(),
                occurred_at: failed.failed_at,
                extra: BTreeMap::from([
                    ("reason".to_string(), json!(failed.reason)),
                    ("attempts".to_string(), json!(failed.attempts)),
                ]),
            },
        ),
    };
    Ok(vec![
        result,
        OutboxEntry::new(source.derive(NOTIFICATION_SALT), &notification, now)?,
        OutboxEntry::new(source.derive(INBOX_SALT), &inbox, now)?,
    ])
}

fn failed(event: &EntityCreated, reason: String, attempts: u32, now: DateTime<Utc>) -> DeliveryFailed {
    DeliveryFailed {
        message_id: event.message_id,
        recipient: event.recipient.clone(),
        failed_at: now,
        reason,
        attempts,
        should_retry: false,
    }
}

async fn write(uow: &mut dyn UnitOfWork, entries: Vec<OutboxEntry>) -> Result<(), UnitOfWorkError> {
    uow.begin().await?;
    for entry in entries {
        uow.outbox().add(entry).await?;
    }
    uow.commit().await
}

#[async_trait]
impl Handler<EntityCreated> for DeliveryService {
    async fn handle(&self, event: EntityCreated, ctx: &MessageContext) -> Result<(), HandlerError> {
        self.deliver(event, ctx).instrument(self.span.clone()).await
    }
}
