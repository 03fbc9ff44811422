//! Message - dispatch サービスが所有する業務エンティティ
//!
//! # ライフサイクル
//! ```text
//! Created → InProgress → Delivered
//!                      ↘ Failed
//! ```
//! 遷移は一方向のみ。Delivered / Failed からは遷移しません。
//!
//! 下流サービスはこのエンティティを直接更新しません。配送結果はイベントとして届き、
//! [`Message::advance_to`] がタイムスタンプを比較して反映します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::ids::MessageId;

pub const ORIGINATOR_MAX_LEN: usize = 200;
pub const RECIPIENT_MAX_LEN: usize = 200;
pub const CONTENT_MAX_LEN: usize = 2000;
pub const DELIVERY_ADDRESS_MAX_LEN: usize = 500;

/// MessageStatus はメッセージの状態（閉じた列挙）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Created,
    InProgress,
    Delivered,
    Failed,
}

impl MessageStatus {
    /// 直接の遷移（1 ステップ）が許されるか
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::InProgress)
                | (Self::InProgress, Self::Delivered)
                | (Self::InProgress, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::InProgress => 1,
            Self::Delivered | Self::Failed => 2,
        }
    }
}

/// NewMessage は作成リクエスト（API 層から受け取る入力）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub originator: String,
    pub recipient: String,
    pub content: String,
    #[serde(default)]
    pub delivery_address: Option<String>,
}

impl NewMessage {
    pub fn new(
        originator: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            originator: originator.into(),
            recipient: recipient.into(),
            content: content.into(),
            delivery_address: None,
        }
    }

    pub fn with_delivery_address(mut self, address: impl Into<String>) -> Self {
        self.delivery_address = Some(address.into());
        self
    }
}

/// Message は配送対象の業務エンティティ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub originator: String,
    pub recipient: String,
    pub content: String,
    pub delivery_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
}

/// StatusChange は [`Message::advance_to`] の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Applied {
        from: MessageStatus,
        to: MessageStatus,
    },
    /// 既に同じか先の状態にいる（重複・順序入れ替わり）
    Ignored,
    /// 最後の更新より古いイベント
    Stale,
}

impl Message {
    /// 入力を検証して `Created` 状態の Message を作る
    ///
    /// 文字列は trim してから検証します。空の配送先アドレスは `None` 扱いです。
    pub fn new(id: MessageId, input: NewMessage, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let originator = required("originator", &input.originator, ORIGINATOR_MAX_LEN)?;
        let recipient = required("recipient", &input.recipient, RECIPIENT_MAX_LEN)?;
        let content = required("content", &input.content, CONTENT_MAX_LEN)?;

        let delivery_address = match input.delivery_address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => {
                Some(bounded("delivery_address", address, DELIVERY_ADDRESS_MAX_LEN)?)
            }
            _ => None,
        };

        Ok(Self {
            id,
            originator,
            recipient,
            content,
            delivery_address,
            created_at: now,
            updated_at: None,
            status: MessageStatus::Created,
        })
    }

    /// 配送イベントを受けて状態を前に進める
    ///
    /// - 終端状態は変わらない
    /// - `at` が `updated_at` より古ければ `Stale`
    /// - `Created` から `Delivered` / `Failed` へは `InProgress` を経由して一気に進める
    pub fn advance_to(&mut self, target: MessageStatus, at: DateTime<Utc>) -> StatusChange {
        if self.status.is_terminal() || target.rank() <= self.status.rank() {
            return StatusChange::Ignored;
        }
        if self.updated_at.is_some_and(|last| at < last) {
            return StatusChange::Stale;
        }

        let from = self.status;
        let mut current = from;
        while current != target {
            current = match current {
                MessageStatus::Created => MessageStatus::InProgress,
                MessageStatus::InProgress if current.can_transition_to(target) => target,
                _ => return StatusChange::Ignored,
            };
        }

        self.status = target;
        self.updated_at = Some(at);
        StatusChange::Applied { from, to: target }
    }
}

fn required(field: &'static str, value: &str, max: usize) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Required { field });
    }
    bounded(field, trimmed, max)
}

fn bounded(field: &'static str, value: &str, max: usize) -> Result<String, ValidationError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(ValidationError::TooLong { field, max, actual });
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn created() -> Message {
        Message::new(
            MessageId::from_ulid(Ulid::new()),
            NewMessage::new("A", "B", "hello"),
            t0(),
        )
        .unwrap()
    }

    #[test]
    fn new_message_is_trimmed_and_created() {
        let input = NewMessage::new("  A ", "B\n", "  hello  ").with_delivery_address("   ");
        let message = Message::new(MessageId::from_ulid(Ulid::new()), input, t0()).unwrap();

        assert_eq!(message.originator, "A");
        assert_eq!(message.recipient, "B");
        assert_eq!(message.content, "hello");
        assert_eq!(message.delivery_address, None);
        assert_eq!(message.status, MessageStatus::Created);
        assert_eq!(message.created_at, t0());
        assert!(message.updated_at.is_none());
    }

    #[rstest]
    #[case::blank_originator(NewMessage::new(" ", "B", "hello"), "originator")]
    #[case::blank_recipient(NewMessage::new("A", "", "hello"), "recipient")]
    #[case::blank_content(NewMessage::new("A", "B", "\t"), "content")]
    fn blank_fields_are_rejected(#[case] input: NewMessage, #[case] field: &'static str) {
        let err = Message::new(MessageId::from_ulid(Ulid::new()), input, t0()).unwrap_err();
        assert_eq!(err, ValidationError::Required { field });
    }

    #[test]
    fn length_limits_apply_after_trimming() {
        let at_limit = NewMessage::new("A", "B", format!(" {} ", "x".repeat(CONTENT_MAX_LEN)));
        assert!(Message::new(MessageId::from_ulid(Ulid::new()), at_limit, t0()).is_ok());

        let too_long = NewMessage::new("A", "x".repeat(RECIPIENT_MAX_LEN + 1), "hello");
        let err = Message::new(MessageId::from_ulid(Ulid::new()), too_long, t0()).unwrap_err();
        assert!(matches!(err, ValidationError::TooLong { field: "recipient", max: 200, actual: 201 }));

        let long_address = NewMessage::new("A", "B", "hello")
            .with_delivery_address("y".repeat(DELIVERY_ADDRESS_MAX_LEN + 1));
        let err = Message::new(MessageId::from_ulid(Ulid::new()), long_address, t0()).unwrap_err();
        assert!(matches!(err, ValidationError::TooLong { field: "delivery_address", .. }));
    }

    #[rstest]
    #[case::start(MessageStatus::Created, MessageStatus::InProgress, true)]
    #[case::deliver(MessageStatus::InProgress, MessageStatus::Delivered, true)]
    #[case::fail(MessageStatus::InProgress, MessageStatus::Failed, true)]
    #[case::skip(MessageStatus::Created, MessageStatus::Delivered, false)]
    #[case::backwards(MessageStatus::InProgress, MessageStatus::Created, false)]
    #[case::out_of_delivered(MessageStatus::Delivered, MessageStatus::Failed, false)]
    #[case::out_of_failed(MessageStatus::Failed, MessageStatus::InProgress, false)]
    fn transitions_are_one_directional(
        #[case] from: MessageStatus,
        #[case] to: MessageStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn advance_walks_through_in_progress() {
        let mut message = created();
        let at = t0() + Duration::seconds(3);

        let change = message.advance_to(MessageStatus::Delivered, at);

        assert_eq!(
            change,
            StatusChange::Applied {
                from: MessageStatus::Created,
                to: MessageStatus::Delivered
            }
        );
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(message.updated_at, Some(at));
    }

    #[test]
    fn terminal_status_never_changes() {
        let mut message = created();
        message.advance_to(MessageStatus::Failed, t0() + Duration::seconds(1));

        let change = message.advance_to(MessageStatus::Delivered, t0() + Duration::seconds(9));

        assert_eq!(change, StatusChange::Ignored);
        assert_eq!(message.status, MessageStatus::Failed);
    }

    #[test]
    fn older_events_are_stale() {
        let mut message = created();
        message.advance_to(MessageStatus::InProgress, t0() + Duration::seconds(10));

        let change = message.advance_to(MessageStatus::Delivered, t0() + Duration::seconds(5));

        assert_eq!(change, StatusChange::Stale);
        assert_eq!(message.status, MessageStatus::InProgress);
    }

    #[test]
    fn same_status_is_ignored() {
        let mut message = created();
        message.advance_to(MessageStatus::InProgress, t0());

        assert_eq!(
            message.advance_to(MessageStatus::InProgress, t0() + Duration::seconds(1)),
            StatusChange::Ignored
        );
        assert_eq!(message.advance_to(MessageStatus::Created, t0()), StatusChange::Ignored);
    }
}
