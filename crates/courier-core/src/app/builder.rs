//! ConsumerAppBuilder - consumer の構築と起動時検証
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 同じ event type を二重登録したら即エラー

use crate::typed::{Contract, Handler, HandlerRegistry, RegistryError};

/// ConsumerAppBuilder は 1 つの queue を読む consumer を構築
///
/// # 使用例
/// ```ignore
/// let app = ConsumerAppBuilder::new(services::INBOX, queues::INBOX_COMMANDS)
///     .register::<RegisterInInbox, _>(InboxService::new(store, span))?
///     .expect_contracts(&[RegisterInInbox::TYPE])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_contracts() で期待される event type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct ConsumerAppBuilder {
    name: String,
    queue: String,
    registry: HandlerRegistry,
    expected: Option<Vec<String>>,
}

/// BuildError は consumer 構築時のエラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Missing handlers for {0:?}. These contracts were expected but not registered.")]
    MissingContracts(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ConsumerAppBuilder {
    /// `name` は冪等性キーの名前空間にもなる consumer 名
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            registry: HandlerRegistry::new(),
            expected: None,
        }
    }

    /// Handler を登録
    pub fn register<T: Contract, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される event type のリストを設定
    pub fn expect_contracts(mut self, event_types: &[&str]) -> Self {
        self.expected = Some(event_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<ConsumerApp, BuildError> {
        if let Some(expected) = &self.expected {
            let registered = self.registry.registered_types();
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingContracts(missing));
            }
        }
        Ok(ConsumerApp {
            name: self.name,
            queue: self.queue,
            registry: self.registry,
        })
    }
}

/// ConsumerApp は検証済みの consumer 定義
///
/// 実行は [`ConsumerGroup`](super::consumer_loop::ConsumerGroup) が行います。
pub struct ConsumerApp {
    name: String,
    queue: String,
    registry: HandlerRegistry,
}

impl ConsumerApp {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}
