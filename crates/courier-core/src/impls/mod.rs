//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryDatabase**: 1 サービス分の MessageStore + OutboxStore + UnitOfWork
//! - **InMemoryBroker**: exchange / queue / DLQ と再配送スケジュール
//! - **InMemoryIdempotencyStore** / **InMemoryInboxStore**
//! - **LoggingNotificationSender**: 通知を tracing に出すだけ
//!
//! # 本番用実装
//! 本番用の実装（リレーショナル DB、AMQP ブローカーなど）は別クレートに配置します。

pub mod inmem_db;
pub mod inmem_broker;
pub mod inmem_idempotency;
pub mod inmem_inbox;
pub mod logging_sender;

// 主要な型を再エクスポート
pub use self::inmem_db::{FaultPoint, InMemoryDatabase, InMemoryUnitOfWork};
pub use self::inmem_broker::{DeadLetter, InMemoryBroker};
pub use self::inmem_idempotency::InMemoryIdempotencyStore;
pub use self::inmem_inbox::InMemoryInboxStore;
pub use self::logging_sender::LoggingNotificationSender;
