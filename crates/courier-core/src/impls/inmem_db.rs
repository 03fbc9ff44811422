//! InMemoryDatabase - 開発・テスト用の 1 サービス分のデータベース
//!
//! # 構成
//! - `Tables`: messages と outbox の 2 テーブル（クエリはすべてここに集約）
//! - `InMemoryDatabase`: commit 済みの状態。`MessageStore` / `OutboxStore` を直接実装
//!   （relay のような 1 書き込み = 1 トランザクションの利用者向け）
//! - `InMemoryUnitOfWork`: 書き込みをステージングし、commit で一括適用する
//!
//! # 原子性
//! commit は「commit 済みテーブルの複製に全書き込みを適用 → すべて成功したら差し替え」
//! なので、途中で失敗しても commit 済みの状態は一切変わりません。
//!
//! # 障害注入
//! [`FaultPoint`] を `fail_next` で仕込むと、次に該当する箇所で `StorageError::Backend` を返します。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::status::OutboxCounts;
use crate::domain::errors::{StorageError, UnitOfWorkError};
use crate::domain::ids::{MessageId, OutboxEntryId};
use crate::domain::message::{Message, MessageStatus};
use crate::domain::outbox::{after, OutboxEntry};
use crate::ports::{MessageStore, OutboxStore, UnitOfWork, UnitOfWorkFactory};

/// 障害を注入できる箇所
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Message の書き込み（トランザクション内では commit 時の適用で発火）
    MessageWrite,
    /// OutboxEntry の書き込み
    OutboxWrite,
    /// commit の最後（全書き込みの適用後、差し替え前）
    Commit,
}

/// 書き込み 1 件
#[derive(Debug, Clone)]
enum Write {
    AddMessage(Message),
    UpdateMessage(Message),
    AddEntry(OutboxEntry),
    UpdateEntry(OutboxEntry),
    /// claim が生きているときだけ適用する（[`OutboxStore::settle`]）
    SettleEntry {
        entry: OutboxEntry,
        claimed_until: Option<DateTime<Utc>>,
    },
}

impl Write {
    fn fault_point(&self) -> FaultPoint {
        match self {
            Self::AddMessage(_) | Self::UpdateMessage(_) => FaultPoint::MessageWrite,
            Self::AddEntry(_) | Self::UpdateEntry(_) | Self::SettleEntry { .. } => {
                FaultPoint::OutboxWrite
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    messages: HashMap<MessageId, Message>,
    outbox: HashMap<OutboxEntryId, OutboxEntry>,
}

impl Tables {
    fn apply(&mut self, write: Write) -> Result<(), StorageError> {
        match write {
            Write::AddMessage(message) => {
                if self.messages.contains_key(&message.id) {
                    return Err(StorageError::Conflict(message.id.to_string()));
                }
                self.messages.insert(message.id, message);
            }
            Write::UpdateMessage(message) => {
                let slot = self
                    .messages
                    .get_mut(&message.id)
                    .ok_or_else(|| StorageError::NotFound(message.id.to_string()))?;
                *slot = message;
            }
            Write::AddEntry(entry) => {
                if self.outbox.contains_key(&entry.id) {
                    return Err(StorageError::Conflict(entry.id.to_string()));
                }
                self.outbox.insert(entry.id, entry);
            }
            Write::UpdateEntry(entry) => {
                let slot = self
                    .outbox
                    .get_mut(&entry.id)
                    .ok_or_else(|| StorageError::NotFound(entry.id.to_string()))?;
                // published は終端
                if slot.published && !entry.published {
                    return Err(StorageError::Conflict(format!(
                        "{} is already published",
                        entry.id
                    )));
                }
                *slot = entry;
            }
            Write::SettleEntry {
                entry,
                claimed_until,
            } => {
                self.settle(entry, claimed_until)?;
            }
        }
        Ok(())
    }

    fn settle(
        &mut self,
        entry: OutboxEntry,
        claimed_until: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let slot = self
            .outbox
            .get_mut(&entry.id)
            .ok_or_else(|| StorageError::NotFound(entry.id.to_string()))?;
        if slot.published || slot.next_retry_at != claimed_until {
            return Ok(false);
        }
        *slot = entry;
        Ok(true)
    }

    fn messages_where(&self, pred: impl Fn(&Message) -> bool) -> Vec<Message> {
        self.messages.values().filter(|m| pred(m)).cloned().collect()
    }

    fn find_by_originator(&self, originator: &str) -> Vec<Message> {
        let mut found = self.messages_where(|m| m.originator == originator);
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found
    }

    fn find_by_recipient(&self, recipient: &str) -> Vec<Message> {
        let mut found = self.messages_where(|m| m.recipient == recipient);
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found
    }

    fn find_by_status(&self, status: MessageStatus) -> Vec<Message> {
        let mut found = self.messages_where(|m| m.status == status);
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    /// 配信可能なエントリの id を作成順に最大 `limit` 件
    fn pending_ids(&self, limit: usize, now: DateTime<Utc>) -> Vec<OutboxEntryId> {
        let mut eligible: Vec<&OutboxEntry> =
            self.outbox.values().filter(|e| e.is_eligible(now)).collect();
        eligible.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        eligible.into_iter().take(limit).map(|e| e.id).collect()
    }

    fn get_pending(&self, limit: usize, now: DateTime<Utc>) -> Vec<OutboxEntry> {
        self.pending_ids(limit, now)
            .into_iter()
            .filter_map(|id| self.outbox.get(&id).cloned())
            .collect()
    }

    fn claim_pending(&mut self, limit: usize, now: DateTime<Utc>, lease: Duration) -> Vec<OutboxEntry> {
        let until = after(now, lease);
        let mut claimed = Vec::new();
        for id in self.pending_ids(limit, now) {
            if let Some(entry) = self.outbox.get_mut(&id) {
                entry.claim(until);
                claimed.push(entry.clone());
            }
        }
        claimed
    }

    fn counts(&self, now: DateTime<Utc>) -> OutboxCounts {
        let mut counts = OutboxCounts::default();
        for entry in self.outbox.values() {
            if entry.published {
                counts.published += 1;
            } else if entry.is_exhausted() {
                counts.exhausted += 1;
            } else if entry.is_scheduled(now) {
                counts.scheduled += 1;
            } else {
                counts.pending += 1;
            }
        }
        counts
    }
}

#[derive(Debug, Default)]
struct Faults {
    armed: HashSet<FaultPoint>,
}

impl Faults {
    /// 仕込まれていれば 1 回だけ発火する
    fn trip(&mut self, point: FaultPoint) -> Result<(), StorageError> {
        if self.armed.remove(&point) {
            return Err(StorageError::Backend(format!("injected fault at {point:?}")));
        }
        Ok(())
    }
}

/// InMemoryDatabase は commit 済みの状態を持つ
///
/// `Clone` は同じデータベースへのハンドルを複製します。
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<StdMutex<Faults>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// 次に `point` に到達したとき 1 回だけ失敗させる
    pub fn fail_next(&self, point: FaultPoint) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .armed
            .insert(point);
    }

    fn trip(&self, point: FaultPoint) -> Result<(), StorageError> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trip(point)
    }

    /// 単独の書き込みを即座に commit する
    async fn write(&self, write: Write) -> Result<(), StorageError> {
        self.trip(write.fault_point())?;
        self.tables.lock().await.apply(write)
    }

    /// ステージングされた書き込みを原子的に commit する
    async fn commit_all(&self, writes: Vec<Write>) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        for write in writes {
            self.trip(write.fault_point())?;
            next.apply(write)?;
        }
        self.trip(FaultPoint::Commit)?;
        *tables = next;
        Ok(())
    }

    /// commit 済みの状態にステージング中の書き込みを重ねたビュー
    async fn overlay(&self, writes: &[Write]) -> Result<Tables, StorageError> {
        let mut view = self.tables.lock().await.clone();
        for write in writes {
            view.apply(write.clone())?;
        }
        Ok(view)
    }

    pub async fn message_count(&self) -> usize {
        self.tables.lock().await.messages.len()
    }

    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<OutboxEntry> = tables.outbox.values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entries
    }
}

#[async_trait]
impl MessageStore for InMemoryDatabase {
    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        Ok(self.tables.lock().await.messages.get(&id).cloned())
    }

    async fn find_by_originator(&self, originator: &str) -> Result<Vec<Message>, StorageError> {
        Ok(self.tables.lock().await.find_by_originator(originator))
    }

    async fn find_by_recipient(&self, recipient: &str) -> Result<Vec<Message>, StorageError> {
        Ok(self.tables.lock().await.find_by_recipient(recipient))
    }

    async fn find_by_status(&self, status: MessageStatus) -> Result<Vec<Message>, StorageError> {
        Ok(self.tables.lock().await.find_by_status(status))
    }

    async fn add(&self, message: Message) -> Result<(), StorageError> {
        self.write(Write::AddMessage(message)).await
    }

    async fn update(&self, message: Message) -> Result<(), StorageError> {
        self.write(Write::UpdateMessage(message)).await
    }
}

#[async_trait]
impl OutboxStore for InMemoryDatabase {
    async fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, StorageError> {
        Ok(self.tables.lock().await.outbox.get(&id).cloned())
    }

    async fn get_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, StorageError> {
        Ok(self.tables.lock().await.get_pending(limit, now))
    }

    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, StorageError> {
        self.trip(FaultPoint::OutboxWrite)?;
        Ok(self.tables.lock().await.claim_pending(limit, now, lease))
    }

    async fn add(&self, entry: OutboxEntry) -> Result<(), StorageError> {
        self.write(Write::AddEntry(entry)).await
    }

    async fn update(&self, entry: OutboxEntry) -> Result<(), StorageError> {
        self.write(Write::UpdateEntry(entry)).await
    }

    async fn settle(
        &self,
        entry: OutboxEntry,
        claimed_until: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        self.trip(FaultPoint::OutboxWrite)?;
        self.tables.lock().await.settle(entry, claimed_until)
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<OutboxCounts, StorageError> {
        Ok(self.tables.lock().await.counts(now))
    }
}

impl UnitOfWorkFactory for InMemoryDatabase {
    fn create(&self) -> Box<dyn UnitOfWork> {
        Box::new(InMemoryUnitOfWork::new(self.clone()))
    }
}

// ========================================
// Unit of Work
// ========================================

#[derive(Debug, Default)]
struct Staging {
    active: bool,
    writes: Vec<Write>,
}

/// トランザクション内のストアが共有するステージング領域
#[derive(Clone)]
struct TxScope {
    db: InMemoryDatabase,
    staging: Arc<StdMutex<Staging>>,
}

impl TxScope {
    fn staging(&self) -> std::sync::MutexGuard<'_, Staging> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Result<Vec<Write>, StorageError> {
        let staging = self.staging();
        if !staging.active {
            return Err(StorageError::Backend(
                "store used outside of an active transaction".into(),
            ));
        }
        Ok(staging.writes.clone())
    }

    async fn view(&self) -> Result<Tables, StorageError> {
        let writes = self.snapshot()?;
        self.db.overlay(&writes).await
    }

    /// 重ねたビューに適用できる書き込みだけをステージングする
    async fn stage(&self, write: Write) -> Result<(), StorageError> {
        let mut view = self.view().await?;
        view.apply(write.clone())?;
        self.staging().writes.push(write);
        Ok(())
    }
}

/// InMemoryUnitOfWork は 1 つの論理操作のトランザクション
pub struct InMemoryUnitOfWork {
    scope: TxScope,
    messages: TxMessages,
    outbox: TxOutbox,
}

impl InMemoryUnitOfWork {
    pub fn new(db: InMemoryDatabase) -> Self {
        let scope = TxScope {
            db,
            staging: Arc::new(StdMutex::new(Staging::default())),
        };
        Self {
            messages: TxMessages(scope.clone()),
            outbox: TxOutbox(scope.clone()),
            scope,
        }
    }

    fn finish(&self) -> Result<Vec<Write>, UnitOfWorkError> {
        let mut staging = self.scope.staging();
        if !staging.active {
            return Err(UnitOfWorkError::NotActive);
        }
        staging.active = false;
        Ok(std::mem::take(&mut staging.writes))
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn begin(&mut self) -> Result<(), UnitOfWorkError> {
        let mut staging = self.scope.staging();
        if staging.active {
            return Err(UnitOfWorkError::AlreadyActive);
        }
        staging.active = true;
        staging.writes.clear();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), UnitOfWorkError> {
        let writes = self.finish()?;
        self.scope.db.commit_all(writes).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), UnitOfWorkError> {
        self.finish()?;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.scope.staging().active
    }

    fn messages(&self) -> &dyn MessageStore {
        &self.messages
    }

    fn outbox(&self) -> &dyn OutboxStore {
        &self.outbox
    }
}

struct TxMessages(TxScope);

#[async_trait]
impl MessageStore for TxMessages {
    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        Ok(self.0.view().await?.messages.get(&id).cloned())
    }

    async fn find_by_originator(&self, originator: &str) -> Result<Vec<Message>, StorageError> {
        Ok(self.0.view().await?.find_by_originator(originator))
    }

    async fn find_by_recipient(&self, recipient: &str) -> Result<Vec<Message>, StorageError> {
        Ok(self.0.view().await?.find_by_recipient(recipient))
    }

    async fn find_by_status(&self, status: MessageStatus) -> Result<Vec<Message>, StorageError> {
        Ok(self.0.view().await?.find_by_status(status))
    }

    async fn add(&self, message: Message) -> Result<(), StorageError> {
        self.0.stage(Write::AddMessage(message)).await
    }

    async fn update(&self, message: Message) -> Result<(), StorageError> {
        self.0.stage(Write::UpdateMessage(message)).await
    }
}

struct TxOutbox(TxScope);

#[async_trait]
impl OutboxStore for TxOutbox {
    async fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, StorageError> {
        Ok(self.0.view().await?.outbox.get(&id).cloned())
    }

    async fn get_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, StorageError> {
        Ok(self.0.view().await?.get_pending(limit, now))
    }

    /// claim もトランザクションの書き込みとして扱い、commit で反映する
    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, StorageError> {
        let claimed = self.0.view().await?.claim_pending(limit, now, lease);
        for entry in &claimed {
            self.0.stage(Write::UpdateEntry(entry.clone())).await?;
        }
        Ok(claimed)
    }

    async fn add(&self, entry: OutboxEntry) -> Result<(), StorageError> {
        self.0.stage(Write::AddEntry(entry)).await
    }

    async fn update(&self, entry: OutboxEntry) -> Result<(), StorageError> {
        self.0.stage(Write::UpdateEntry(entry)).await
    }

    /// commit 時にもう一度条件を評価する
    async fn settle(
        &self,
        entry: OutboxEntry,
        claimed_until: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let applies = self.0.view().await?.settle(entry.clone(), claimed_until)?;
        if applies {
            self.0
                .stage(Write::SettleEntry {
                    entry,
                    claimed_until,
                })
                .await?;
        }
        Ok(applies)
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<OutboxCounts, StorageError> {
        Ok(self.0.view().await?.counts(now))
    }
}
