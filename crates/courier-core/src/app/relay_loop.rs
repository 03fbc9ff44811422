//! OutboxRelay - outbox を読んでブローカーへ publish するループ
//!
//! # フロー（1 tick）
//! 1. `OutboxStore::claim_pending()` で配信可能なエントリを最大 batch_size 件 claim
//! 2. event type からルーティングして `Broker::publish()`
//! 3. 成功 → `mark_published()`、失敗 → `record_failure()`（バックオフ、上限で exhausted）
//! 4. `OutboxStore::settle()` で書き戻す。claim の lease が切れて別の relay が
//!    claim し直していたら結果は捨てる（publish 済みを未 publish に戻さない）
//!
//! # 失敗の扱い
//! - 1 件の publish 失敗はそのエントリの状態（attempt_count, next_retry_at）に吸収し、
//!   バッチの他のエントリには影響させない
//! - ストアの失敗はログに出してループを続ける
//!
//! # キャンセル
//! claim と publish はキャンセルと競合させます。途中で止めたエントリは publish 済みにも
//! 試行済みにもならず、claim の lease が切れれば再び配信可能になります。
//! publish 後の書き戻しは競合させません（published フラグを中途半端にしないため）。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::app::config::RelayConfig;
use crate::domain::envelope::BrokerMessage;
use crate::domain::errors::{BrokerError, StorageError};
use crate::domain::outbox::{OutboxEntry, RetryDisposition};
use crate::ports::{Broker, Clock, OutboxStore};
use crate::topology::{route, RetryPolicy};

/// RelayReport は 1 tick の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// claim した件数
    pub fetched: usize,
    pub published: usize,
    pub retry_scheduled: usize,
    /// この tick で上限に達した件数
    pub exhausted: usize,
    /// キャンセルで処理しなかった件数（lease 切れ後に再配信可能）
    pub abandoned: usize,
    /// 結果を書き戻せなかった件数（lease 切れ後に再配信される）
    pub store_errors: usize,
    /// publish 中に lease が切れ、別の relay が claim し直していたので結果を捨てた件数
    pub claim_lost: usize,
}

impl RelayReport {
    fn merge(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Published => self.published += 1,
            EntryOutcome::RetryScheduled => self.retry_scheduled += 1,
            EntryOutcome::Exhausted => self.exhausted += 1,
            EntryOutcome::Abandoned => self.abandoned += 1,
            EntryOutcome::StoreError => self.store_errors += 1,
            EntryOutcome::ClaimLost => self.claim_lost += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Published,
    RetryScheduled,
    Exhausted,
    Abandoned,
    StoreError,
    ClaimLost,
}

/// OutboxRelay は 1 プロセスに 1 つの定期ループ
///
/// 複数プロセスで同じストアに対して動かしても、claim の lease で同じエントリを
/// 同時に publish しないようにしています。それでも重複 publish はあり得るので、
/// consumer は冪等でなければなりません。
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
    retry_policy: RetryPolicy,
    span: Span,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
        span: Span,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            config,
            retry_policy: RetryPolicy::STANDARD,
            span,
        }
    }

    /// `token` がキャンセルされるまで poll_interval ごとに tick する
    pub async fn run(&self, token: CancellationToken) {
        let span = self.span.clone();
        async {
            tracing::info!(
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                "outbox relay started"
            );
            while !token.is_cancelled() {
                match self.run_once(&token).await {
                    Ok(report) if report.fetched > 0 => {
                        tracing::debug!(?report, "outbox relay tick");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "outbox relay tick failed"),
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
            tracing::info!("outbox relay stopped");
        }
        .instrument(span)
        .await
    }

    /// 1 バッチ分を処理する
    ///
    /// Err になるのは claim 自体が失敗したときだけ。
    pub async fn run_once(&self, token: &CancellationToken) -> Result<RelayReport, StorageError> {
        let now = self.clock.now();
        let batch = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(RelayReport::default()),
            claimed = self.store.claim_pending(self.config.batch_size, now, self.config.claim_lease) => claimed?,
        };

        let mut report = RelayReport {
            fetched: batch.len(),
            ..RelayReport::default()
        };
        for entry in batch {
            if token.is_cancelled() {
                report.merge(EntryOutcome::Abandoned);
                continue;
            }
            report.merge(self.relay_entry(entry, token).await);
        }
        Ok(report)
    }

    async fn relay_entry(&self, mut entry: OutboxEntry, token: &CancellationToken) -> EntryOutcome {
        let claimed_until = entry.next_retry_at;
        let publish = async {
            let destination = route(&entry.event_type)?;
            let message = BrokerMessage::from_entry(&entry)
                .map_err(|e| BrokerError::Serialization(e.to_string()))?;
            self.broker.publish(&destination, message).await
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(outbox_entry_id = %entry.id, "publish abandoned on shutdown");
                return EntryOutcome::Abandoned;
            }
            result = publish => result,
        };

        let now = self.clock.now();
        let (outcome, error) = match result {
            Ok(()) => {
                entry.mark_published(now);
                (EntryOutcome::Published, None)
            }
            Err(e) => match entry.record_failure(&e.to_string(), now, &self.retry_policy) {
                RetryDisposition::Scheduled { .. } => (EntryOutcome::RetryScheduled, Some(e)),
                RetryDisposition::Exhausted => (EntryOutcome::Exhausted, Some(e)),
            },
        };

        let id = entry.id;
        let snapshot = entry.clone();
        match self.store.settle(entry, claimed_until).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    outbox_entry_id = %id,
                    discarded = ?outcome,
                    "claim lease expired before the outcome was recorded, another relay owns the entry"
                );
                return EntryOutcome::ClaimLost;
            }
            Err(e) => {
                tracing::error!(
                    outbox_entry_id = %id,
                    error = %e,
                    "failed to record relay outcome, entry will be retried after its lease"
                );
                return EntryOutcome::StoreError;
            }
        }

        match (outcome, error) {
            (EntryOutcome::RetryScheduled, Some(e)) => {
                tracing::warn!(
                    outbox_entry_id = %id,
                    event_type = %snapshot.event_type,
                    attempt = snapshot.attempt_count,
                    next_retry_at = ?snapshot.next_retry_at,
                    error = %e,
                    "publish failed, retry scheduled"
                );
            }
            (EntryOutcome::Exhausted, Some(e)) => {
                tracing::error!(
                    outbox_entry_id = %id,
                    event_type = %snapshot.event_type,
                    correlation_id = %snapshot.correlation_id,
                    attempts = snapshot.attempt_count,
                    error = %e,
                    "publish attempts exhausted, entry needs operator attention"
                );
            }
            _ => tracing::debug!(outbox_entry_id = %id, "outbox entry published"),
        }
        outcome
    }
}
