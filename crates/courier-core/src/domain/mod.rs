//! Domain model (IDs, message, outbox entry, contracts, envelope, errors).

pub mod ids;
pub mod message;
pub mod outbox;
pub mod contracts;
pub mod envelope;
pub mod errors;

pub use self::ids::{MessageId, OutboxEntryId};
pub use self::message::{Message, MessageStatus, NewMessage, StatusChange};
pub use self::outbox::{OutboxEntry, RetryDisposition};
pub use self::contracts::{
    DeliveryCompleted, DeliveryFailed, EntityCreated, InboxEventKind, NotificationKind,
    RegisterInInbox, SendNotification,
};
pub use self::envelope::BrokerMessage;
pub use self::errors::{
    BrokerError, HandlerError, StorageError, UnitOfWorkError, ValidationError,
};
