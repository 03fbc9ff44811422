//! Broker port - exchange / queue / DLQ を持つメッセージブローカー
//!
//! # 責務の分担
//! - 配送試行回数の管理、再配送の遅延、DLQ への移動はブローカーの仕事
//! - consumer は結果（ack / nack / reject）を報告するだけで、回数を数えない

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::envelope::BrokerMessage;
use crate::domain::errors::BrokerError;
use crate::topology::{Destination, Topology};

/// nack した後にブローカーがどうしたか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// `delay` 後に同じ queue へ再配送される
    Requeued { delay: Duration },
    /// MAX_ATTEMPTS に達したので DLQ へ移された
    DeadLettered,
}

/// Delivery は consumer が受け取った 1 件の配送
///
/// consumer はこれを所有し、必ず `ack` / `nack` / `reject` のいずれかで終わらせます。
#[async_trait]
pub trait Delivery: Send {
    fn message(&self) -> &BrokerMessage;

    /// 受信した queue 名
    fn queue(&self) -> &str;

    /// 配送試行番号（初回は 1）
    fn attempt(&self) -> u32;

    /// 処理成功
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// 一時的な失敗。ブローカーが再配送するか DLQ へ送る
    async fn nack(self: Box<Self>, reason: String) -> Result<NackOutcome, BrokerError>;

    /// 恒久的な失敗。再配送せずに DLQ へ送る
    async fn reject(self: Box<Self>, reason: String) -> Result<(), BrokerError>;
}

/// Broker は publish と受信のインターフェース
#[async_trait]
pub trait Broker: Send + Sync {
    /// exchange / queue / binding と、各 queue の DLQ を宣言する（冪等）
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        destination: &Destination,
        message: BrokerMessage,
    ) -> Result<(), BrokerError>;

    /// `queue` から 1 件受け取る（届くまで待つ）
    async fn receive(&self, queue: &str) -> Result<Box<dyn Delivery>, BrokerError>;
}
