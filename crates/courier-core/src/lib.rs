//! courier-core
//!
//! Transactional outbox と冪等 consumer による、サービス間メッセージ配送の部品。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, outbox, contracts, envelope, errors）
//! - **ports**: 抽象化レイヤー（MessageStore, OutboxStore, UnitOfWork, Broker, IdempotencyStore, など）
//! - **topology**: exchange / queue 名、DLQ、リトライ間隔、ルーティング
//! - **typed**: 型付き Contract API（Contract trait, Handler trait, HandlerRegistry）
//! - **app**: アプリケーションロジック（dispatch, relay_loop, consumer_loop, builder, config, status）
//! - **services**: 下流サービス（delivery, dispatch_status, notification, inbox）
//! - **impls**: 実装（InMemoryDatabase, InMemoryBroker など開発用）
//!
//! # 配送保証
//! - Message と outbox エントリは同じローカルトランザクションで書く
//! - relay は at-least-once で publish する（失敗はバックオフして再試行、上限で exhausted）
//! - consumer は message_id で重複を捨てる

pub mod domain;
pub mod ports;
pub mod topology;
pub mod typed;
pub mod app;
pub mod services;
pub mod impls;
