//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + Phantom type
//! すべての ID は ULID (Universally Unique Lexicographically Sortable Identifier) です。
//! `Id<T>` で共通実装を提供し、`T` は実行時には使わないマーカー型として
//! コンパイル時の型安全性だけを提供します。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順に並ぶので outbox の作成順とも整合する
//! - **分散生成可能**: 複数サービスが調整なしで生成できる
//! - **UUID互換**: 128-bit
//!
//! ## ワイヤ表現
//! serde では素の ULID 文字列として (de)serialize されます（`"01J..."`）。
//! Display だけがプレフィックス付き（`msg-01J...`）です。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"msg-", "outbox-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// # 例
/// ```ignore
/// let message_id: MessageId = Id::from(Ulid::new());
/// let entry_id: OutboxEntryId = Id::from(Ulid::new());
/// // 異なる型なので混同できない
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// `self` と `salt` だけから決まる別の ID を作る
    ///
    /// 同じ入力からは常に同じ ID になります（再配送された入力から作る outbox エントリの
    /// id に使い、二重に書こうとすると `StorageError::Conflict` になるようにする）。
    /// 時刻部分は `self` のものを引き継ぎます。
    pub fn derive<U: IdMarker>(&self, salt: &str) -> Id<U> {
        let hash = u128::from(fnv1a(salt.as_bytes()));
        let random = self.ulid.random() ^ (hash | (hash << 64));
        Id::from_ulid(Ulid::from_parts(self.ulid.timestamp_ms(), random))
    }
}

/// FNV-1a (64-bit)。プロセスやバージョンをまたいで同じ値になる
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Accepts both the prefixed Display form and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Message（業務エンティティ）のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// OutboxEntry のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutboxEntry {}

impl IdMarker for OutboxEntry {
    fn prefix() -> &'static str {
        "outbox-"
    }
}

/// Identifier of a dispatched message. Also the correlation id of every
/// integration message the message causes.
pub type MessageId = Id<Message>;

/// Identifier of an outbox entry. Travels on the wire as the broker message id,
/// so consumers use it as their idempotency key.
pub type OutboxEntryId = Id<OutboxEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid1 = Ulid::new();
        let ulid2 = Ulid::new();

        let message = MessageId::from_ulid(ulid1);
        let entry = OutboxEntryId::from_ulid(ulid2);

        assert_eq!(message.as_ulid(), ulid1);
        assert_eq!(entry.as_ulid(), ulid2);

        assert!(message.to_string().starts_with("msg-"));
        assert!(entry.to_string().starts_with("outbox-"));
        // let _: MessageId = entry; // <- does not compile
    }

    #[test]
    fn derived_ids_are_stable_per_salt() {
        let source = OutboxEntryId::from_ulid(Ulid::new());

        let result: OutboxEntryId = source.derive("result");
        let again: OutboxEntryId = source.derive("result");
        let notification: OutboxEntryId = source.derive("notification");

        assert_eq!(result, again);
        assert_ne!(result, notification);
        assert_ne!(result, source);
        assert_eq!(result.as_ulid().timestamp_ms(), source.as_ulid().timestamp_ms());

        let other: OutboxEntryId = OutboxEntryId::from_ulid(Ulid::new()).derive("result");
        assert_ne!(result, other);
    }

    #[test]
    fn ids_serialize_as_bare_ulid_strings() {
        let ulid = Ulid::new();
        let id = MessageId::from_ulid(ulid);

        let serialized = serde_json::to_string(&id).unwrap();
        assert_eq!(serialized, format!("\"{ulid}\""));

        let back: MessageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_accepts_prefixed_and_bare_forms() {
        let id = OutboxEntryId::from_ulid(Ulid::new());

        let from_display: OutboxEntryId = id.to_string().parse().unwrap();
        let from_bare: OutboxEntryId = id.as_ulid().to_string().parse().unwrap();

        assert_eq!(from_display, id);
        assert_eq!(from_bare, id);
        assert!("msg-not-a-ulid".parse::<MessageId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<MessageId>(), size_of::<Ulid>());
        assert_eq!(size_of::<OutboxEntryId>(), 16);
    }
}
