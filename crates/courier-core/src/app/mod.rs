//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **CreateMessageHandler**: Message と outbox エントリを 1 トランザクションで書く
//! - **OutboxRelay**: outbox を読んでブローカーへ publish（バックオフ付き）
//! - **ConsumerAppBuilder**: consumer の構築と起動時検証
//! - **ConsumerGroup**: queue を読み、冪等に handler を実行して ack / nack / reject
//! - **Config** / **Status**: 実行時設定と運用者向けビュー

pub mod builder;
pub mod config;
pub mod consumer_loop;
pub mod dispatch;
pub mod relay_loop;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ConsumerApp, ConsumerAppBuilder};
pub use self::config::{ConfigError, ConsumerConfig, RelayConfig};
pub use self::consumer_loop::{process_delivery, ConsumerGroup, Disposition};
pub use self::dispatch::{CreateMessageError, CreateMessageHandler};
pub use self::relay_loop::{OutboxRelay, RelayReport};
pub use self::status::{DeadLetterCount, OutboxCounts};
