//! HandlerRegistry - event type タグから handler への明示的な対応表
//!
//! 起動時に組み立て、実行中は読み取り専用で共有します（ロック不要）。

use std::collections::HashMap;
use std::sync::Arc;

use super::contract::Contract;
use super::handler::{DynHandler, Handler, TypedHandler};

/// HandlerRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<DeliveryCompleted, _>(ProjectionHandler::new(store))?;
///
/// let handler = registry.get("DeliveryCompleted");
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

/// RegistryError は HandlerRegistry の操作エラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Handler for event type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Contract, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let event_type = T::TYPE.to_string();
        if self.handlers.contains_key(&event_type) {
            return Err(RegistryError::AlreadyRegistered(event_type));
        }
        let typed_handler = TypedHandler::new(handler);
        self.handlers.insert(event_type, Arc::new(typed_handler));
        Ok(())
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(event_type).cloned()
    }

    /// 登録済みのタグ（ソート済み）
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
