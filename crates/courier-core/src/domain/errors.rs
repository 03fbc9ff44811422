//! Errors - エラー型と分類
//!
//! 関心ごとに thiserror の enum を分けています。
//!
//! | 分類 | 型 | 扱い |
//! |------|----|------|
//! | 入力検証 | `ValidationError` | 呼び出し側が直す。リトライしない |
//! | ストレージ / ブローカー障害 | `StorageError`, `BrokerError` | relay / broker の再配送で吸収 |
//! | トランザクション境界の誤用 | `UnitOfWorkError::AlreadyActive` / `NotActive` | プログラミングエラー。即座に伝播 |
//! | consumer の処理失敗 | `HandlerError` | Retryable は再配送、Permanent は DLQ へ |

use thiserror::Error;

/// StorageError はストレージ層の失敗
///
/// エントリ固有のエラー種別は持たず、呼び出し側へそのまま伝播します。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("record {0} already exists")]
    Conflict(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// UnitOfWorkError はトランザクション境界のエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnitOfWorkError {
    /// begin() を commit()/rollback() の前に再度呼んだ
    #[error("a transaction is already active in this unit of work")]
    AlreadyActive,

    /// begin() していないのに commit()/rollback() した
    #[error("no active transaction in this unit of work")]
    NotActive,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl UnitOfWorkError {
    /// Misuse of the transaction boundary, as opposed to an infrastructure failure.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::AlreadyActive | Self::NotActive)
    }
}

/// BrokerError はブローカーへの publish / 受信の失敗
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// ルーティング表に存在しない event type
    #[error("no route for event type '{0}'")]
    UnknownEventType(String),

    /// 宣言されていない exchange / queue
    #[error("destination '{0}' is not declared")]
    UnknownDestination(String),

    /// exchange に bind された queue が 1 つもない
    #[error("exchange '{0}' has no bound queue")]
    Unroutable(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// ValidationError は Command Handler の入力検証エラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("{field} must be at most {max} characters (got {actual})")]
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },
}

/// HandlerError は consumer handler の失敗分類
///
/// - `Retryable`: broker に nack して再配送させる（上限に達したら DLQ）
/// - `Permanent`: 再試行しても直らない。即座に DLQ へ送る
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("retryable failure: {0}")]
    Retryable(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<StorageError> for HandlerError {
    /// ストレージ障害は一時的なものとして扱う。
    /// 壊れたデータ（Serialization）は何度読み直しても壊れている。
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Serialization(_) => Self::Permanent(err.to_string()),
            _ => Self::Retryable(err.to_string()),
        }
    }
}

impl From<UnitOfWorkError> for HandlerError {
    fn from(err: UnitOfWorkError) -> Self {
        match err {
            UnitOfWorkError::Storage(storage) => storage.into(),
            misuse => Self::Permanent(misuse.to_string()),
        }
    }
}
