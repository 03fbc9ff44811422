//! Broker topology: exchange/queue names, dead-letter naming, retry limits and routing.
//!
//! Every service builds against these names and limits, so they are constants
//! rather than configuration.
//!
//! ```text
//! message.events  (fan-out) ──► delivery.message.events
//! delivery.events (fan-out) ──► dispatch.delivery.events
//! notification.commands     (point-to-point)
//! inbox.commands            (point-to-point)
//!
//! every queue q ──► q.dlq
//! ```

use std::time::Duration;

use crate::domain::contracts::{
    DeliveryCompleted, DeliveryFailed, EntityCreated, RegisterInInbox, SendNotification,
};
use crate::domain::errors::BrokerError;
use crate::typed::Contract;

/// Fan-out exchanges, one per business-event family.
pub mod exchanges {
    pub const MESSAGE_EVENTS: &str = "message.events";
    pub const DELIVERY_EVENTS: &str = "delivery.events";
}

/// Point-to-point command queues.
pub mod queues {
    pub const NOTIFICATION_COMMANDS: &str = "notification.commands";
    pub const INBOX_COMMANDS: &str = "inbox.commands";
}

/// Service names used to derive subscriber queue names.
pub mod services {
    pub const DISPATCH: &str = "dispatch";
    pub const DELIVERY: &str = "delivery";
    pub const NOTIFICATION: &str = "notification";
    pub const INBOX: &str = "inbox";
}

pub const DLQ_SUFFIX: &str = ".dlq";

/// Maximum publish attempts per outbox entry, and maximum deliveries per broker message.
pub const MAX_ATTEMPTS: u32 = 5;

/// Maximum unacknowledged deliveries held by one consumer.
pub const PREFETCH: usize = 10;

/// Dead-letter queue companion of `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DLQ_SUFFIX}")
}

/// Queue a service binds to an event exchange: `<service>.<exchange>`.
pub fn subscriber_queue(service: &str, exchange: &str) -> String {
    format!("{service}.{exchange}")
}

/// Fixed escalating backoff sequence shared by the relay and broker redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: &'static [Duration],
}

const STANDARD_DELAYS: [Duration; MAX_ATTEMPTS as usize] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

impl RetryPolicy {
    /// 1s, 5s, 15s, 30s, 60s.
    pub const STANDARD: RetryPolicy = RetryPolicy {
        delays: &STANDARD_DELAYS,
    };

    pub fn max_attempts(&self) -> u32 {
        self.delays.len() as u32
    }

    /// Delay before the next try, given the number of attempts already made (1-indexed).
    ///
    /// - attempt 1 (first failure): 1s
    /// - attempt 3: 15s
    /// - attempt 5: 60s
    ///
    /// Attempts beyond the sequence keep the last delay; callers stop retrying
    /// at [`RetryPolicy::max_attempts`] anyway.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let index = (attempts.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[index]
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Where a message with a given event type is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Exchange(&'static str),
    Queue(&'static str),
}

impl Destination {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exchange(name) | Self::Queue(name) => name,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exchange(name) => write!(f, "exchange:{name}"),
            Self::Queue(name) => write!(f, "queue:{name}"),
        }
    }
}

/// Resolve the destination for an event type tag.
pub fn route(event_type: &str) -> Result<Destination, BrokerError> {
    match event_type {
        t if t == EntityCreated::TYPE => Ok(Destination::Exchange(exchanges::MESSAGE_EVENTS)),
        t if t == DeliveryCompleted::TYPE || t == DeliveryFailed::TYPE => {
            Ok(Destination::Exchange(exchanges::DELIVERY_EVENTS))
        }
        t if t == SendNotification::TYPE => Ok(Destination::Queue(queues::NOTIFICATION_COMMANDS)),
        t if t == RegisterInInbox::TYPE => Ok(Destination::Queue(queues::INBOX_COMMANDS)),
        other => Err(BrokerError::UnknownEventType(other.to_string())),
    }
}

/// An exchange-to-queue binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: &'static str,
    pub queue: String,
}

/// The full set of exchanges, queues and bindings to declare on a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<&'static str>,
    pub queues: Vec<String>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    pub fn standard() -> Self {
        let delivery_subscriber = subscriber_queue(services::DELIVERY, exchanges::MESSAGE_EVENTS);
        let dispatch_subscriber = subscriber_queue(services::DISPATCH, exchanges::DELIVERY_EVENTS);

        Self {
            exchanges: vec![exchanges::MESSAGE_EVENTS, exchanges::DELIVERY_EVENTS],
            queues: vec![
                delivery_subscriber.clone(),
                dispatch_subscriber.clone(),
                queues::NOTIFICATION_COMMANDS.to_string(),
                queues::INBOX_COMMANDS.to_string(),
            ],
            bindings: vec![
                Binding {
                    exchange: exchanges::MESSAGE_EVENTS,
                    queue: delivery_subscriber,
                },
                Binding {
                    exchange: exchanges::DELIVERY_EVENTS,
                    queue: dispatch_subscriber,
                },
            ],
        }
    }

    /// Dead-letter queues for every declared queue.
    pub fn dead_letter_queues(&self) -> Vec<String> {
        self.queues.iter().map(|q| dead_letter_queue(q)).collect()
    }
}
