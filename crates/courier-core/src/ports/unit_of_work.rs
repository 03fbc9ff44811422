//! UnitOfWork port - 1 つのローカルトランザクションの境界
//!
//! Message の書き込みと OutboxEntry の書き込みを同じ境界で行い、
//! 両方とも commit されるか、どちらも残らないかのどちらかにします。
//!
//! # 規約
//! - `begin()` 中に再度 `begin()` → `UnitOfWorkError::AlreadyActive`
//! - `begin()` せずに `commit()` / `rollback()` → `UnitOfWorkError::NotActive`
//! - `commit()` が失敗したらトランザクションは終了し、書き込みは何も残らない
//! - `begin()` と `commit()` の間で失敗したら、呼び出し側が `rollback()` する
//!
//! UnitOfWork は 1 つの論理操作が所有し、タスク間で共有しません（`&mut self`）。

use async_trait::async_trait;

use crate::domain::errors::UnitOfWorkError;
use crate::ports::{MessageStore, OutboxStore};

/// UnitOfWork はトランザクション境界とその中で使うストアを提供
///
/// # 使用例
/// ```ignore
/// let mut uow = factory.create();
/// uow.begin().await?;
/// uow.messages().add(message).await?;
/// uow.outbox().add(entry).await?;
/// uow.commit().await?;
/// ```
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&mut self) -> Result<(), UnitOfWorkError>;

    async fn commit(&mut self) -> Result<(), UnitOfWorkError>;

    async fn rollback(&mut self) -> Result<(), UnitOfWorkError>;

    fn is_active(&self) -> bool;

    /// トランザクション内の MessageStore（自分の未 commit の書き込みが読める）
    fn messages(&self) -> &dyn MessageStore;

    /// トランザクション内の OutboxStore（自分の未 commit の書き込みが読める）
    fn outbox(&self) -> &dyn OutboxStore;
}

/// UnitOfWorkFactory は論理操作ごとに新しい UnitOfWork を作る
pub trait UnitOfWorkFactory: Send + Sync {
    fn create(&self) -> Box<dyn UnitOfWork>;
}
