//! Typed - 型付き Contract API
//!
//! このモジュールは event type タグの typo を型で排除し、
//! Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Contract` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod contract;
pub mod handler;
pub mod registry;

// 主要な trait/型 を再エクスポート
pub use self::contract::Contract;
pub use self::handler::{DynHandler, Handler, MessageContext, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
