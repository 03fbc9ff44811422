//! ConsumerGroup - 1 つの queue を読む worker 群
//!
//! # フロー（1 配送）
//! 1. `IdempotencyStore::is_processed()` で処理済みならそのまま ack
//! 2. event type から handler を引く。無ければ reject（DLQ へ）
//! 3. handler 実行
//!    - Ok → 処理済みを記録して ack
//!    - Retryable → nack（ブローカーがバックオフ後に再配送、上限で DLQ）
//!    - Permanent → reject（即 DLQ）
//!
//! # 並行数
//! worker 1 つにつき未 ack の配送は最大 1 件。worker 数を PREFETCH 以下にすることで
//! 1 consumer あたりの未 ack 数を制限します。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::app::builder::ConsumerApp;
use crate::app::config::ConsumerConfig;
use crate::domain::errors::{BrokerError, HandlerError};
use crate::ports::{Broker, Delivery, IdempotencyStore, NackOutcome};
use crate::topology::PREFETCH;
use crate::typed::MessageContext;

/// receive が失敗したときに次を試すまでの待ち時間
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// 1 配送をどう決着させたか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// handler が成功して ack した
    Acked,
    /// 処理済みだったので handler を呼ばずに ack した
    Duplicate,
    /// nack して `delay` 後に再配送される
    Redelivery { delay: Duration },
    /// DLQ に移った
    DeadLettered,
}

/// 受け取った配送を 1 件処理して ack / nack / reject する
///
/// Err になるのはブローカーへの決着（ack など）が失敗したときだけ。
pub async fn process_delivery(
    app: &ConsumerApp,
    idempotency: &dyn IdempotencyStore,
    delivery: Box<dyn Delivery>,
) -> Result<Disposition, BrokerError> {
    let ctx = MessageContext::new(delivery.message(), delivery.queue(), delivery.attempt());

    match idempotency.is_processed(app.name(), ctx.message_id).await {
        Ok(true) => {
            tracing::debug!(message_id = %ctx.message_id, "duplicate delivery skipped");
            delivery.ack().await?;
            return Ok(Disposition::Duplicate);
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(message_id = %ctx.message_id, error = %e, "idempotency check failed");
            return nack(delivery, &ctx, e.to_string()).await;
        }
    }

    let Some(handler) = app.registry().get(&ctx.event_type) else {
        tracing::error!(
            message_id = %ctx.message_id,
            event_type = %ctx.event_type,
            "no handler for event type, dead-lettering"
        );
        let reason = format!("no handler for event type '{}'", ctx.event_type);
        delivery.reject(reason).await?;
        return Ok(Disposition::DeadLettered);
    };

    let payload = delivery.message().payload.clone();
    match handler.handle_dyn(payload, &ctx).await {
        Ok(()) => {
            if let Err(e) = idempotency.mark_processed(app.name(), ctx.message_id).await {
                tracing::warn!(
                    message_id = %ctx.message_id,
                    error = %e,
                    "failed to record processed message"
                );
            }
            delivery.ack().await?;
            tracing::debug!(message_id = %ctx.message_id, event_type = %ctx.event_type, "message handled");
            Ok(Disposition::Acked)
        }
        Err(HandlerError::Retryable(reason)) => nack(delivery, &ctx, reason).await,
        Err(HandlerError::Permanent(reason)) => {
            tracing::error!(
                message_id = %ctx.message_id,
                correlation_id = %ctx.correlation_id,
                event_type = %ctx.event_type,
                error = %reason,
                "permanent failure, dead-lettering"
            );
            delivery.reject(reason).await?;
            Ok(Disposition::DeadLettered)
        }
    }
}

async fn nack(
    delivery: Box<dyn Delivery>,
    ctx: &MessageContext,
    reason: String,
) -> Result<Disposition, BrokerError> {
    match delivery.nack(reason.clone()).await? {
        NackOutcome::Requeued { delay } => {
            tracing::warn!(
                message_id = %ctx.message_id,
                attempt = ctx.attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %reason,
                "handler failed, redelivery scheduled"
            );
            Ok(Disposition::Redelivery { delay })
        }
        NackOutcome::DeadLettered => {
            tracing::error!(
                message_id = %ctx.message_id,
                correlation_id = %ctx.correlation_id,
                attempts = ctx.attempt,
                error = %reason,
                "redelivery attempts exhausted, dead-lettered"
            );
            Ok(Disposition::DeadLettered)
        }
    }
}

/// Consumer worker group handle.
/// - `token` をキャンセルすると新しい配送を受け取らなくなる
/// - 実行中の handler は中断しない
pub struct ConsumerGroup {
    token: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl ConsumerGroup {
    /// `config.workers` 個（1..=PREFETCH に丸める）の worker を spawn
    pub fn spawn(
        app: Arc<ConsumerApp>,
        broker: Arc<dyn Broker>,
        idempotency: Arc<dyn IdempotencyStore>,
        config: &ConsumerConfig,
        span: Span,
        token: CancellationToken,
    ) -> Self {
        let workers = config.workers.clamp(1, PREFETCH);
        let joins = (0..workers)
            .map(|worker_id| {
                let worker_span = tracing::info_span!(parent: &span, "consumer_worker", worker_id);
                let app = Arc::clone(&app);
                let broker = Arc::clone(&broker);
                let idempotency = Arc::clone(&idempotency);
                let token = token.clone();
                tokio::spawn(
                    async move { worker_loop(app, broker, idempotency, token).await }
                        .instrument(worker_span),
                )
            })
            .collect();

        span.in_scope(|| {
            tracing::info!(consumer = %app.name(), queue = %app.queue(), workers, "consumer started");
        });
        Self { token, joins }
    }

    pub fn worker_count(&self) -> usize {
        self.joins.len()
    }

    /// Request shutdown for all workers.
    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "consumer worker panicked");
            }
        }
    }
}

async fn worker_loop(
    app: Arc<ConsumerApp>,
    broker: Arc<dyn Broker>,
    idempotency: Arc<dyn IdempotencyStore>,
    token: CancellationToken,
) {
    loop {
        // receive は待つので shutdown と競合させる
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = broker.receive(app.queue()) => received,
        };

        let delivery = match received {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::error!(queue = %app.queue(), error = %e, "receive failed");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_BACKOFF) => continue,
                }
            }
        };

        // ここから先は中断しない（決着をつけてから次の判定）
        if let Err(e) = process_delivery(&app, idempotency.as_ref(), delivery).await {
            tracing::error!(queue = %app.queue(), error = %e, "failed to settle delivery");
        }
    }
    tracing::debug!("consumer worker stopped");
}
