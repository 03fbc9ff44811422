//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（データベース、メッセージブローカー、配送チャネルなど）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - 各サービスのデータベースが source of truth（正本）
//! - 業務エンティティと outbox は同じローカルトランザクションで書く
//! - ブローカーは at-least-once。重複は consumer 側の冪等性で吸収する

pub mod clock;
pub mod id_generator;
pub mod message_store;
pub mod outbox_store;
pub mod unit_of_work;
pub mod broker;
pub mod idempotency;
pub mod channels;
pub mod inbox_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::message_store::MessageStore;
pub use self::outbox_store::OutboxStore;
pub use self::unit_of_work::{UnitOfWork, UnitOfWorkFactory};
pub use self::broker::{Broker, Delivery, NackOutcome};
pub use self::idempotency::IdempotencyStore;
pub use self::channels::{ChannelError, DeliveryChannel, DeliveryReport, NotificationSender};
pub use self::inbox_store::{InboxEntry, InboxStore};
