//! Services - dispatch の下流にいる consumer 側サービス
//!
//! 各サービスは `Handler<T>` を実装し、`consumer_app()` で自分の queue を読む
//! [`ConsumerApp`](crate::app::ConsumerApp) を作ります。
//!
//! - **delivery**: EntityCreated → 配送 → 結果 event と command を自分の outbox へ
//! - **dispatch_status**: 配送結果で dispatch 側の Message 状態を進める
//! - **notification**: SendNotification を送信
//! - **inbox**: RegisterInInbox を recipient の inbox に記録

pub mod delivery;
pub mod dispatch_status;
pub mod inbox;
pub mod notification;

pub use self::delivery::DeliveryService;
pub use self::dispatch_status::DispatchStatusProjection;
pub use self::inbox::InboxService;
pub use self::notification::NotificationService;
