//! MessageStore port - 業務エンティティ（Message）の永続化
//!
//! dispatch サービスだけが書き込みます。下流サービスはイベント経由で状態を伝えます。

use async_trait::async_trait;

use crate::domain::errors::StorageError;
use crate::domain::ids::MessageId;
use crate::domain::message::{Message, MessageStatus};

/// MessageStore は Message の正本
///
/// # 並び順
/// - `find_by_originator` / `find_by_recipient`: 新しい順（一覧表示用）
/// - `find_by_status`: 古い順（処理待ちの取り出し用）
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError>;

    async fn find_by_originator(&self, originator: &str) -> Result<Vec<Message>, StorageError>;

    async fn find_by_recipient(&self, recipient: &str) -> Result<Vec<Message>, StorageError>;

    async fn find_by_status(&self, status: MessageStatus) -> Result<Vec<Message>, StorageError>;

    /// 同じ id が既にあれば `StorageError::Conflict`
    async fn add(&self, message: Message) -> Result<(), StorageError>;

    /// id が無ければ `StorageError::NotFound`
    async fn update(&self, message: Message) -> Result<(), StorageError>;
}
