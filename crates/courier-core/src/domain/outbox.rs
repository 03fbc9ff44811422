//! OutboxEntry - 「イベントが発生したので publish しなければならない」という永続レコード
//!
//! # ライフサイクル
//! - Command Handler が業務エンティティと同じトランザクションで作成する
//! - 以降は relay だけが更新する（試行回数の記録、published フラグ）
//! - `published == true` になったら終端。relay は再試行も削除もしない
//!
//! # 配信可能条件
//! ```text
//! published == false
//!   AND (next_retry_at IS NULL OR next_retry_at <= now)
//!   AND attempt_count < MAX_ATTEMPTS
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StorageError;
use super::ids::{MessageId, OutboxEntryId};
use crate::topology::{RetryPolicy, MAX_ATTEMPTS};
use crate::typed::Contract;

/// last_error に保存する最大文字数
pub const LAST_ERROR_MAX_LEN: usize = 2000;

/// OutboxEntry の永続化形状
///
/// フィールド名はストレージとの契約なので、そのまま round-trip できなければなりません。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    /// payload のスキーマを識別するタグ（ルーティングのキー）
    pub event_type: String,
    /// JSON にシリアライズしたペイロード
    pub payload: String,
    pub correlation_id: MessageId,
    pub created_at: DateTime<Utc>,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// 失敗を記録した後の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// `at` 以降に再び配信可能
    Scheduled { at: DateTime<Utc> },
    /// MAX_ATTEMPTS に達した。以後 get_pending に現れない
    Exhausted,
}

impl OutboxEntry {
    /// イベントをシリアライズして未 publish のエントリを作る
    pub fn new<E: Contract>(
        id: OutboxEntryId,
        event: &E,
        now: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            id,
            event_type: E::TYPE.to_string(),
            payload: serde_json::to_string(event)?,
            correlation_id: event.correlation_id(),
            created_at: now,
            published: false,
            published_at: None,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
        })
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.published
            && self.next_retry_at.is_none_or(|at| at <= now)
            && self.attempt_count < MAX_ATTEMPTS
    }

    /// 試行上限に達して publish されないまま止まっている
    pub fn is_exhausted(&self) -> bool {
        !self.published && self.attempt_count >= MAX_ATTEMPTS
    }

    /// 再試行待ち（未 publish、上限未満、next_retry_at が未来）
    pub fn is_scheduled(&self, now: DateTime<Utc>) -> bool {
        !self.published
            && self.attempt_count < MAX_ATTEMPTS
            && self.next_retry_at.is_some_and(|at| at > now)
    }

    /// relay が処理中であることを示すため、`until` まで他の relay から隠す
    ///
    /// attempt_count は変えません。relay が落ちても `until` を過ぎれば再び配信可能になります。
    pub fn claim(&mut self, until: DateTime<Utc>) {
        self.next_retry_at = Some(until);
    }

    pub fn mark_published(&mut self, now: DateTime<Utc>) {
        self.published = true;
        self.published_at = Some(now);
        self.last_error = None;
    }

    /// publish 失敗を記録し、次の再試行時刻を決める
    ///
    /// `next_retry_at = now + backoff(attempt_count)`。上限到達時も同じ計算で埋めますが、
    /// 配信可能条件の attempt_count 側で除外されます。
    pub fn record_failure(
        &mut self,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> RetryDisposition {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(truncate(error, LAST_ERROR_MAX_LEN));

        let at = after(now, policy.next_delay(self.attempt_count));
        self.next_retry_at = Some(at);

        if self.attempt_count >= MAX_ATTEMPTS.min(policy.max_attempts()) {
            RetryDisposition::Exhausted
        } else {
            RetryDisposition::Scheduled { at }
        }
    }

    /// payload を型付きで復元する
    pub fn decode<T: Contract>(&self) -> Result<T, StorageError> {
        if self.event_type != T::TYPE {
            return Err(StorageError::Serialization(format!(
                "entry {} holds '{}', not '{}'",
                self.id,
                self.event_type,
                T::TYPE
            )));
        }
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// `now + delay`。表現できない未来は上限に丸める
pub(crate) fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contracts::{DeliveryCompleted, EntityCreated};
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn event() -> EntityCreated {
        EntityCreated {
            message_id: MessageId::from_ulid(Ulid::new()),
            originator: "A".into(),
            recipient: "B".into(),
            content: "hello".into(),
            created_at: t0(),
            delivery_address: None,
        }
    }

    fn entry() -> OutboxEntry {
        OutboxEntry::new(OutboxEntryId::from_ulid(Ulid::new()), &event(), t0()).unwrap()
    }

    #[test]
    fn new_entry_is_pending() {
        let event = event();
        let entry = OutboxEntry::new(OutboxEntryId::from_ulid(Ulid::new()), &event, t0()).unwrap();

        assert_eq!(entry.event_type, "EntityCreated");
        assert_eq!(entry.correlation_id, event.message_id);
        assert!(!entry.published);
        assert_eq!(entry.attempt_count, 0);
        assert!(entry.next_retry_at.is_none());
        assert!(entry.is_eligible(t0()));
        assert_eq!(entry.decode::<EntityCreated>().unwrap(), event);
    }

    #[test]
    fn decode_rejects_a_different_contract() {
        let err = entry().decode::<DeliveryCompleted>().unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[rstest]
    #[case::fresh(false, None, 0, true)]
    #[case::due(false, Some(0), 2, true)]
    #[case::not_yet_due(false, Some(1), 1, false)]
    #[case::published(true, None, 0, false)]
    #[case::exhausted(false, Some(-10), 5, false)]
    fn eligibility(
        #[case] published: bool,
        #[case] retry_offset_secs: Option<i64>,
        #[case] attempts: u32,
        #[case] eligible: bool,
    ) {
        let mut entry = entry();
        entry.published = published;
        entry.next_retry_at = retry_offset_secs.map(|s| t0() + Duration::seconds(s));
        entry.attempt_count = attempts;

        assert_eq!(entry.is_eligible(t0()), eligible);
    }

    #[test]
    fn third_failure_schedules_fifteen_seconds_out() {
        let mut entry = entry();
        let policy = RetryPolicy::STANDARD;

        entry.record_failure("boom 1", t0(), &policy);
        entry.record_failure("boom 2", t0() + Duration::seconds(1), &policy);
        let third = t0() + Duration::seconds(6);
        let disposition = entry.record_failure("boom 3", third, &policy);

        assert_eq!(entry.attempt_count, 3);
        assert_eq!(entry.next_retry_at, Some(third + Duration::seconds(15)));
        assert_eq!(
            disposition,
            RetryDisposition::Scheduled {
                at: third + Duration::seconds(15)
            }
        );
        assert_eq!(entry.last_error.as_deref(), Some("boom 3"));
        assert!(!entry.published);
    }

    #[test]
    fn fifth_failure_exhausts_the_entry() {
        let mut entry = entry();
        let policy = RetryPolicy::STANDARD;
        let mut now = t0();
        let mut previous_delay = Duration::zero();

        for attempt in 1..=MAX_ATTEMPTS {
            let disposition = entry.record_failure("down", now, &policy);
            let delay = entry.next_retry_at.unwrap() - now;
            assert!(delay >= previous_delay);
            previous_delay = delay;

            if attempt < MAX_ATTEMPTS {
                assert!(matches!(disposition, RetryDisposition::Scheduled { .. }));
            } else {
                assert_eq!(disposition, RetryDisposition::Exhausted);
            }
            now = entry.next_retry_at.unwrap();
        }

        assert!(entry.is_exhausted());
        assert!(!entry.is_eligible(now + Duration::days(365)));
    }

    #[test]
    fn publish_after_a_failure_clears_the_error() {
        let mut entry = entry();
        entry.record_failure("transient", t0(), &RetryPolicy::STANDARD);

        let at = t0() + Duration::seconds(1);
        entry.mark_published(at);

        assert_eq!(entry.attempt_count, 1);
        assert!(entry.published);
        assert_eq!(entry.published_at, Some(at));
        assert!(entry.last_error.is_none());
        assert!(!entry.is_eligible(at + Duration::hours(1)));
    }

    #[test]
    fn claim_hides_entry_until_lease_expires() {
        let mut entry = entry();
        entry.claim(t0() + Duration::seconds(30));

        assert!(!entry.is_eligible(t0() + Duration::seconds(29)));
        assert!(entry.is_scheduled(t0() + Duration::seconds(29)));
        assert!(entry.is_eligible(t0() + Duration::seconds(30)));
        assert!(!entry.is_scheduled(t0() + Duration::seconds(30)));
        assert_eq!(entry.attempt_count, 0);
    }

    #[test]
    fn long_errors_are_truncated_on_char_boundaries() {
        let mut entry = entry();
        let error = "é".repeat(LAST_ERROR_MAX_LEN + 10);

        entry.record_failure(&error, t0(), &RetryPolicy::STANDARD);

        assert_eq!(
            entry.last_error.unwrap().chars().count(),
            LAST_ERROR_MAX_LEN
        );
    }
}
