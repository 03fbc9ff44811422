//! Contract trait - サービス間でやり取りするペイロードの型定義
//!
//! event type タグと Rust の型を 1:1 に対応付けます。
//! タグはワイヤ上の契約なので、一度決めたら変えません。
//!
//! # バージョニング
//! スキーマは追加的にのみ変更します（新しいフィールドは `#[serde(default)]` の Option）。
//! 古い consumer は知らないフィールドを無視し、新しい consumer は欠けたフィールドを既定値で読みます。

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::ids::MessageId;

/// Contract は event / command の型とタグを対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ParcelShipped {
///     message_id: MessageId,
/// }
///
/// impl Contract for ParcelShipped {
///     const TYPE: &'static str = "ParcelShipped";
///
///     fn correlation_id(&self) -> MessageId {
///         self.message_id
///     }
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: outbox に JSON で保存するため
/// - `DeserializeOwned`: broker から受け取った payload の復元のため
/// - `Send + Sync + 'static`: handler を Arc に格納して worker 間で共有するため
pub trait Contract: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// event type タグ（ルーティングと handler 解決のキー）
    const TYPE: &'static str;

    /// このペイロードを引き起こした Message の id
    fn correlation_id(&self) -> MessageId;
}
