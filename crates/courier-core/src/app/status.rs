//! Status - 運用者向けの集計ビュー
//!
//! 上限に達した outbox エントリや DLQ に落ちたメッセージは例外ではなく終端状態です。
//! 自動では回復しないので、ここで数えて外から見えるようにします。

use serde::{Deserialize, Serialize};

/// OutboxCounts は outbox エントリの状態別件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    /// いま配信可能
    pub pending: usize,
    /// 再試行待ち、または他の relay が claim 中
    pub scheduled: usize,
    pub published: usize,
    /// MAX_ATTEMPTS に達して止まっている（要対応）
    pub exhausted: usize,
}

impl OutboxCounts {
    pub fn total(&self) -> usize {
        self.pending + self.scheduled + self.published + self.exhausted
    }

    /// 未 publish のまま残っている件数（exhausted を含む）
    pub fn unpublished(&self) -> usize {
        self.total() - self.published
    }
}

/// DeadLetterCount は DLQ ごとの滞留件数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterCount {
    pub queue: String,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_include_every_state() {
        let counts = OutboxCounts {
            pending: 2,
            scheduled: 1,
            published: 7,
            exhausted: 1,
        };
        assert_eq!(counts.total(), 11);
        assert_eq!(counts.unpublished(), 4);
    }
}
