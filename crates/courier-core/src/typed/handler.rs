//! Handler trait - Contract を処理する consumer handler の定義
//!
//! # 二層構造
//! - `Handler<T>`: 型付き。`T` しか受け取れない
//! - `DynHandler`: object-safe。`HashMap<String, Arc<dyn DynHandler>>` に格納するため
//! - `TypedHandler<T, H>` が JSON のデコードを挟んで前者を後者に変換する

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::contract::Contract;
use crate::domain::envelope::BrokerMessage;
use crate::domain::errors::HandlerError;
use crate::domain::ids::{MessageId, OutboxEntryId};

/// MessageContext は handler に渡す配送メタデータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// 冪等性キー（元の OutboxEntry の id）
    pub message_id: OutboxEntryId,
    pub correlation_id: MessageId,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub queue: String,
    /// 配送試行番号（初回は 1）
    pub attempt: u32,
}

impl MessageContext {
    pub fn new(message: &BrokerMessage, queue: impl Into<String>, attempt: u32) -> Self {
        Self {
            message_id: message.message_id,
            correlation_id: message.correlation_id,
            event_type: message.event_type.clone(),
            occurred_at: message.occurred_at,
            queue: queue.into(),
            attempt,
        }
    }
}

/// Handler は Contract を処理する
///
/// # 使用例
/// ```ignore
/// struct ParcelShippedHandler;
///
/// #[async_trait]
/// impl Handler<ParcelShipped> for ParcelShippedHandler {
///     async fn handle(&self, event: ParcelShipped, ctx: &MessageContext) -> Result<(), HandlerError> {
///         tracing::info!(message_id = %ctx.message_id, "shipped");
///         Ok(())
///     }
/// }
/// ```
///
/// # 冪等性
/// 同じメッセージが再配送されても安全でなければなりません。
/// ランタイムは処理済みの message_id をスキップしますが、記録前に落ちた場合は再実行されます。
#[async_trait]
pub trait Handler<T: Contract>: Send + Sync {
    async fn handle(&self, message: T, ctx: &MessageContext) -> Result<(), HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &MessageContext,
    ) -> Result<(), HandlerError>;

    fn event_type(&self) -> &'static str;
}

pub struct TypedHandler<T: Contract, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Contract, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Contract, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    /// デコードできない payload は何度受け取ってもデコードできないので Permanent
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        let message: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::Permanent(format!("json decode ({}): {e}", T::TYPE)))?;
        self.handler.handle(message, ctx).await
    }

    fn event_type(&self) -> &'static str {
        T::TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contracts::DeliveryCompleted;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl Handler<DeliveryCompleted> for CountingHandler {
        async fn handle(
            &self,
            _message: DeliveryCompleted,
            _ctx: &MessageContext,
        ) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ctx() -> MessageContext {
        MessageContext {
            message_id: OutboxEntryId::from_ulid(Ulid::new()),
            correlation_id: MessageId::from_ulid(Ulid::new()),
            event_type: DeliveryCompleted::TYPE.into(),
            occurred_at: Utc::now(),
            queue: "dispatch.delivery.events".into(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_dispatches() {
        let typed = TypedHandler::<DeliveryCompleted, _>::new(CountingHandler(AtomicUsize::new(0)));
        let payload = json!({
            "message_id": MessageId::from_ulid(Ulid::new()),
            "recipient": "B",
            "delivered_at": "2024-01-01T12:00:00Z",
        });

        typed.handle_dyn(payload, &ctx()).await.unwrap();

        assert_eq!(typed.handler.0.load(Ordering::SeqCst), 1);
        assert_eq!(typed.event_type(), "DeliveryCompleted");
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let typed = TypedHandler::<DeliveryCompleted, _>::new(CountingHandler(AtomicUsize::new(0)));

        let err = typed
            .handle_dyn(json!({ "unexpected": true }), &ctx())
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Permanent(_)));
        assert_eq!(typed.handler.0.load(Ordering::SeqCst), 0);
    }
}
