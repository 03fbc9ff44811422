//! OutboxStore port - OutboxEntry の永続化
//!
//! # 設計原則
//! - 配信可能条件はストア側で評価する（取得後にフィルタしない）
//! - `claim_pending` は「取得 + 他 relay から隠す」を 1 回の原子的な操作で行う
//! - relay の結果は `settle` で claim が生きているときだけ書き戻す
//! - エラーは `StorageError` のみ（エントリ固有のエラー種別は持たない）

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::status::OutboxCounts;
use crate::domain::errors::StorageError;
use crate::domain::ids::OutboxEntryId;
use crate::domain::outbox::OutboxEntry;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, StorageError>;

    /// `now` 時点で配信可能なエントリを作成順（古い順）に最大 `limit` 件返す
    ///
    /// 読み取り専用。relay は [`OutboxStore::claim_pending`] を使う。
    async fn get_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, StorageError>;

    /// `get_pending` と同じ条件で取得し、同時に `next_retry_at = now + lease` に進める
    ///
    /// 返されたエントリ（claim 済みの状態）は、`lease` が過ぎるまで他の呼び出しに現れません。
    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, StorageError>;

    /// 同じ id が既にあれば `StorageError::Conflict`
    async fn add(&self, entry: OutboxEntry) -> Result<(), StorageError>;

    /// id が無ければ `StorageError::NotFound`
    ///
    /// publish 済みのエントリを未 publish に戻す書き込みは `StorageError::Conflict`。
    async fn update(&self, entry: OutboxEntry) -> Result<(), StorageError>;

    /// claim したエントリの relay 結果を書き戻す（compare-and-set）
    ///
    /// 保存されている行が未 publish で、`next_retry_at` が `claimed_until`（claim 時に
    /// 返された値）のままのときだけ `entry` で置き換えて `true` を返します。
    /// lease が切れて別の relay が claim し直した、あるいは publish 済みにした場合は
    /// 何もせずに `false` を返します。
    async fn settle(
        &self,
        entry: OutboxEntry,
        claimed_until: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<OutboxCounts, StorageError>;
}
