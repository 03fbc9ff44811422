//! In-memory broker implementation.
//!
//! Fan-out exchanges copy each message to every bound queue. Each queue keeps a
//! ready list plus a min-heap of scheduled redeliveries; `receive` promotes due
//! redeliveries and waits on the queue's `Notify` or the next due time.
//!
//! Delivery attempts are counted here, not in consumers: `nack` on attempt
//! `n < MAX_ATTEMPTS` schedules attempt `n + 1` after `retry_policy.next_delay(n)`,
//! and `nack` on the last attempt (or any `reject`) moves the message to
//! `<queue>.dlq`.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::app::status::DeadLetterCount;
use crate::domain::envelope::BrokerMessage;
use crate::domain::errors::BrokerError;
use crate::ports::{Broker, Clock, Delivery, NackOutcome, SystemClock};
use crate::topology::{dead_letter_queue, Destination, RetryPolicy, Topology, MAX_ATTEMPTS};

/// A message that exhausted redelivery or was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: BrokerMessage,
    /// Queue the message was consumed from.
    pub source_queue: String,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Pending {
    message: BrokerMessage,
    /// Attempt number of the next delivery (1-indexed).
    attempt: u32,
}

/// Scheduled redelivery. Reverse ordering so BinaryHeap pops the earliest first.
#[derive(Debug)]
struct Scheduled {
    due: Instant,
    pending: Pending,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.due.cmp(&self.due)
    }
}

struct QueueState {
    ready: VecDeque<Pending>,
    scheduled: BinaryHeap<Scheduled>,
    unacked: usize,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            unacked: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Move redeliveries whose time has come to the ready list.
    fn promote_scheduled(&mut self) {
        let now = Instant::now();
        while self.scheduled.peek().is_some_and(|entry| entry.due <= now) {
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.pending);
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    /// exchange -> bound queues
    exchanges: HashMap<String, Vec<String>>,
    queues: HashMap<String, QueueState>,
    dead_letters: HashMap<String, Vec<DeadLetter>>,
    failing_publishes: u32,
}

impl BrokerState {
    fn enqueue(&mut self, queue: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownDestination(queue.to_string()))?;
        state.ready.push_back(Pending {
            message,
            attempt: 1,
        });
        state.notify.notify_one();
        Ok(())
    }

    fn settle(&mut self, queue: &str) -> Result<&mut QueueState, BrokerError> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownDestination(queue.to_string()))?;
        state.unacked = state.unacked.saturating_sub(1);
        Ok(state)
    }

    fn dead_letter(&mut self, letter: DeadLetter) {
        self.dead_letters
            .entry(dead_letter_queue(&letter.source_queue))
            .or_default()
            .push(letter);
    }
}

/// In-memory broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl InMemoryBroker {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self::with_clock(retry_policy, Arc::new(SystemClock))
    }

    /// Clock used to timestamp dead letters.
    pub fn with_clock(retry_policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            retry_policy,
            clock,
        }
    }

    /// Make the next `n` publishes fail with `BrokerError::Unavailable`.
    pub async fn fail_next_publishes(&self, n: u32) {
        self.state.lock().await.failing_publishes = n;
    }

    /// Messages waiting in `queue`, ready or scheduled for redelivery.
    pub async fn depth(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len() + q.scheduled.len())
    }

    /// Deliveries handed out from `queue` and not yet settled.
    pub async fn unacked(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.unacked)
    }

    /// Contents of a dead-letter queue, oldest first.
    pub async fn dead_letters(&self, dlq: &str) -> Vec<DeadLetter> {
        let state = self.state.lock().await;
        state.dead_letters.get(dlq).cloned().unwrap_or_default()
    }

    /// Every declared dead-letter queue with its size, sorted by name.
    pub async fn dead_letter_counts(&self) -> Vec<DeadLetterCount> {
        let state = self.state.lock().await;
        let mut counts: Vec<DeadLetterCount> = state
            .dead_letters
            .iter()
            .map(|(queue, letters)| DeadLetterCount {
                queue: queue.clone(),
                count: letters.len(),
            })
            .collect();
        counts.sort_by(|a, b| a.queue.cmp(&b.queue));
        counts
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(RetryPolicy::STANDARD)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        for exchange in &topology.exchanges {
            state.exchanges.entry(exchange.to_string()).or_default();
        }
        for queue in &topology.queues {
            state.queues.entry(queue.clone()).or_insert_with(QueueState::new);
            state.dead_letters.entry(dead_letter_queue(queue)).or_default();
        }
        for binding in &topology.bindings {
            if !state.queues.contains_key(&binding.queue) {
                return Err(BrokerError::UnknownDestination(binding.queue.clone()));
            }
            let bound = state
                .exchanges
                .get_mut(binding.exchange)
                .ok_or_else(|| BrokerError::UnknownDestination(binding.exchange.to_string()))?;
            if !bound.contains(&binding.queue) {
                bound.push(binding.queue.clone());
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        destination: &Destination,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Unavailable("injected publish failure".into()));
        }

        match destination {
            Destination::Queue(queue) => state.enqueue(queue, message),
            Destination::Exchange(exchange) => {
                let bound = state
                    .exchanges
                    .get(*exchange)
                    .cloned()
                    .ok_or_else(|| BrokerError::UnknownDestination(exchange.to_string()))?;
                if bound.is_empty() {
                    return Err(BrokerError::Unroutable(exchange.to_string()));
                }
                for queue in bound {
                    state.enqueue(&queue, message.clone())?;
                }
                Ok(())
            }
        }
    }

    async fn receive(&self, queue: &str) -> Result<Box<dyn Delivery>, BrokerError> {
        loop {
            let (notify, next_wake) = {
                let mut state = self.state.lock().await;
                let q = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| BrokerError::UnknownDestination(queue.to_string()))?;
                q.promote_scheduled();

                if let Some(pending) = q.ready.pop_front() {
                    q.unacked += 1;
                    return Ok(Box::new(InMemoryDelivery {
                        queue: queue.to_string(),
                        message: pending.message,
                        attempt: pending.attempt,
                        broker: self.clone(),
                    }));
                }

                (
                    Arc::clone(&q.notify),
                    q.scheduled.peek().map(|entry| entry.due),
                )
            };

            // Wait for a publish OR the next scheduled redelivery
            if let Some(wake_time) = next_wake {
                tokio::select! {
                    _ = notify.notified() => {},
                    _ = tokio::time::sleep_until(wake_time) => {},
                }
            } else {
                notify.notified().await;
            }
        }
    }
}

/// Delivery handed out by [`InMemoryBroker::receive`].
struct InMemoryDelivery {
    queue: String,
    message: BrokerMessage,
    attempt: u32,
    broker: InMemoryBroker,
}

impl InMemoryDelivery {
    async fn dead_letter(self, reason: String) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().await;
        state.settle(&self.queue)?;
        state.dead_letter(DeadLetter {
            message: self.message,
            source_queue: self.queue,
            attempts: self.attempt,
            reason,
            dead_lettered_at: self.broker.clock.now(),
        });
        Ok(())
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn message(&self) -> &BrokerMessage {
        &self.message
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().await;
        state.settle(&self.queue)?;
        Ok(())
    }

    async fn nack(self: Box<Self>, reason: String) -> Result<NackOutcome, BrokerError> {
        let max_attempts = MAX_ATTEMPTS.min(self.broker.retry_policy.max_attempts());
        if self.attempt >= max_attempts {
            (*self).dead_letter(reason).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let InMemoryDelivery {
            queue,
            message,
            attempt,
            broker,
        } = *self;
        let delay: Duration = broker.retry_policy.next_delay(attempt);
        let notify = {
            let mut state = broker.state.lock().await;
            let q = state.settle(&queue)?;
            q.scheduled.push(Scheduled {
                due: Instant::now() + delay,
                pending: Pending {
                    message,
                    attempt: attempt + 1,
                },
            });
            Arc::clone(&q.notify)
        }; // Lock released here

        // Wake a waiting receiver so it re-arms its timer for the new due time
        notify.notify_one();
        Ok(NackOutcome::Requeued { delay })
    }

    async fn reject(self: Box<Self>, reason: String) -> Result<(), BrokerError> {
        (*self).dead_letter(reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{MessageId, OutboxEntryId};
    use crate::topology::{exchanges, queues};
    use serde_json::json;
    use ulid::Ulid;

    fn message(event_type: &str) -> BrokerMessage {
        BrokerMessage {
            message_id: OutboxEntryId::from_ulid(Ulid::new()),
            event_type: event_type.into(),
            correlation_id: MessageId::from_ulid(Ulid::new()),
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    async fn declared() -> InMemoryBroker {
        let broker = InMemoryBroker::default();
        broker.declare(&Topology::standard()).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn exchange_fans_out_to_bound_queues() {
        let broker = declared().await;
        let sent = message("EntityCreated");

        broker
            .publish(&Destination::Exchange(exchanges::MESSAGE_EVENTS), sent.clone())
            .await
            .unwrap();

        let delivery = broker.receive("delivery.message.events").await.unwrap();
        assert_eq!(delivery.message(), &sent);
        assert_eq!(delivery.attempt(), 1);
        assert_eq!(delivery.queue(), "delivery.message.events");
        assert_eq!(broker.unacked("delivery.message.events").await, 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked("delivery.message.events").await, 0);
        assert_eq!(broker.depth("delivery.message.events").await, 0);
    }

    #[tokio::test]
    async fn undeclared_destinations_are_errors() {
        let broker = declared().await;

        let err = broker
            .publish(&Destination::Queue("nope"), message("X"))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::UnknownDestination("nope".into()));

        broker
            .declare(&Topology {
                exchanges: vec!["lonely.events"],
                queues: vec![],
                bindings: vec![],
            })
            .await
            .unwrap();
        let err = broker
            .publish(&Destination::Exchange("lonely.events"), message("X"))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::Unroutable("lonely.events".into()));
    }

    #[tokio::test]
    async fn injected_publish_failures_are_transient() {
        let broker = declared().await;
        broker.fail_next_publishes(1).await;
        let destination = Destination::Queue(queues::INBOX_COMMANDS);

        let first = broker.publish(&destination, message("RegisterInInbox")).await;
        let second = broker.publish(&destination, message("RegisterInInbox")).await;

        assert!(matches!(first, Err(BrokerError::Unavailable(_))));
        assert!(second.is_ok());
        assert_eq!(broker.depth(queues::INBOX_COMMANDS).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_after_the_backoff_interval() {
        let broker = declared().await;
        let queue = queues::NOTIFICATION_COMMANDS;
        broker
            .publish(&Destination::Queue(queue), message("SendNotification"))
            .await
            .unwrap();

        let mut last: Option<(Instant, Duration)> = None;
        for (i, secs) in [1u64, 5, 15, 30].into_iter().enumerate() {
            let delivery = broker.receive(queue).await.unwrap();
            if let Some((nacked_at, delay)) = last {
                assert!(nacked_at.elapsed() >= delay);
            }
            assert_eq!(delivery.attempt(), i as u32 + 1);

            let delay = Duration::from_secs(secs);
            let outcome = delivery.nack("busy".into()).await.unwrap();
            assert_eq!(outcome, NackOutcome::Requeued { delay });
            assert_eq!(broker.depth(queue).await, 1);
            last = Some((Instant::now(), delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fifth_failed_delivery_goes_to_the_dlq() {
        let broker = declared().await;
        let queue = queues::NOTIFICATION_COMMANDS;
        let sent = message("SendNotification");
        broker
            .publish(&Destination::Queue(queue), sent.clone())
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..MAX_ATTEMPTS {
            let delivery = broker.receive(queue).await.unwrap();
            outcomes.push(delivery.nack("still failing".into()).await.unwrap());
        }

        assert_eq!(outcomes.last(), Some(&NackOutcome::DeadLettered));
        assert_eq!(broker.depth(queue).await, 0);
        let letters = broker.dead_letters("notification.commands.dlq").await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message, sent);
        assert_eq!(letters[0].attempts, MAX_ATTEMPTS);
        assert_eq!(letters[0].source_queue, queue);
    }

    #[tokio::test]
    async fn reject_dead_letters_immediately() {
        let broker = declared().await;
        let queue = queues::INBOX_COMMANDS;
        broker
            .publish(&Destination::Queue(queue), message("RegisterInInbox"))
            .await
            .unwrap();

        let delivery = broker.receive(queue).await.unwrap();
        delivery.reject("poison".into()).await.unwrap();

        let letters = broker.dead_letters("inbox.commands.dlq").await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
        assert_eq!(letters[0].reason, "poison");

        let counts = broker.dead_letter_counts().await;
        assert_eq!(counts.len(), 4);
        assert!(counts
            .iter()
            .any(|c| c.queue == "inbox.commands.dlq" && c.count == 1));
    }

    #[tokio::test]
    async fn receive_waits_for_a_publish() {
        let broker = declared().await;
        let queue = queues::INBOX_COMMANDS;

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive(queue).await.map(|d| d.attempt()) })
        };
        tokio::task::yield_now().await;
        broker
            .publish(&Destination::Queue(queue), message("RegisterInInbox"))
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(1));
    }
}
