use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use courier_core::app::config::RELAY_POLL_INTERVAL_MS;
use courier_core::app::{
    ConsumerApp, ConsumerConfig, ConsumerGroup, CreateMessageHandler, DeadLetterCount,
    OutboxCounts, OutboxRelay, RelayConfig,
};
use courier_core::domain::contracts::EntityCreated;
use courier_core::domain::message::{MessageStatus, NewMessage};
use courier_core::impls::{
    InMemoryBroker, InMemoryDatabase, InMemoryIdempotencyStore, InMemoryInboxStore,
    LoggingNotificationSender,
};
use courier_core::ports::{
    Broker, ChannelError, Clock, DeliveryChannel, DeliveryReport, IdGenerator, IdempotencyStore,
    InboxStore, MessageStore, OutboxStore, SystemClock, UlidGenerator,
};
use courier_core::services::{
    DeliveryService, DispatchStatusProjection, InboxService, NotificationService,
};
use courier_core::topology::{RetryPolicy, Topology};

/// 配送チャネルのシミュレーション
/// - アドレスが `bounce:` で始まる → 配送不能
/// - recipient が `flaky` → 初回だけチャネル障害（再配送で成功）
struct SimulatedChannel {
    failed_once: Mutex<HashSet<String>>,
}

impl SimulatedChannel {
    fn new() -> Self {
        Self {
            failed_once: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl DeliveryChannel for SimulatedChannel {
    async fn deliver(&self, message: &EntityCreated) -> Result<DeliveryReport, ChannelError> {
        sleep(Duration::from_millis(50)).await;

        if message.recipient == "flaky" {
            let mut failed = self
                .failed_once
                .lock()
                .map_err(|_| ChannelError::Unavailable("channel state poisoned".into()))?;
            if failed.insert(message.message_id.to_string()) {
                return Err(ChannelError::Unavailable("gateway timeout".into()));
            }
        }

        match message.delivery_address.as_deref() {
            Some(address) if address.starts_with("bounce:") => Ok(DeliveryReport::Undeliverable {
                reason: format!("address {address} rejected the message"),
            }),
            Some(address) => Ok(DeliveryReport::Delivered {
                notes: Some(format!("handed to {address} at {}", Utc::now().format("%H:%M:%S"))),
            }),
            None => Ok(DeliveryReport::Delivered { notes: None }),
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    messages: Vec<(String, String, MessageStatus)>,
    dispatch_outbox: OutboxCounts,
    delivery_outbox: OutboxCounts,
    inbox_entries: usize,
    notifications_sent: usize,
    dead_letters: Vec<DeadLetterCount>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) 設定。デモなので poll 間隔の既定値だけ短くする
    let relay_config = RelayConfig::from_lookup(|key| {
        std::env::var(key)
            .ok()
            .or_else(|| (key == RELAY_POLL_INTERVAL_MS).then(|| "200".to_string()))
    })?;
    let consumer_config = ConsumerConfig::from_env()?;

    // (B) 共有インフラ
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
    let broker = InMemoryBroker::new(RetryPolicy::STANDARD);
    broker.declare(&Topology::standard()).await?;
    let broker_port: Arc<dyn Broker> = Arc::new(broker.clone());
    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());
    let token = CancellationToken::new();

    // (C) サービスごとのデータベースと relay
    let dispatch_db = InMemoryDatabase::new();
    let delivery_db = InMemoryDatabase::new();
    let inbox = InMemoryInboxStore::new();
    let sender = LoggingNotificationSender::new();

    let relays: Vec<JoinHandle<()>> = [("dispatch", &dispatch_db), ("delivery", &delivery_db)]
        .into_iter()
        .map(|(service, db)| {
            let relay = OutboxRelay::new(
                Arc::new(db.clone()),
                Arc::clone(&broker_port),
                Arc::clone(&clock),
                relay_config.clone(),
                tracing::info_span!("relay", service),
            );
            let token = token.clone();
            tokio::spawn(async move { relay.run(token).await })
        })
        .collect();

    // (D) consumer を起動
    let apps: Vec<ConsumerApp> = vec![
        DeliveryService::new(
            Arc::new(SimulatedChannel::new()),
            Arc::new(delivery_db.clone()),
            Arc::clone(&clock),
            tracing::info_span!("delivery"),
        )
        .consumer_app()?,
        DispatchStatusProjection::new(
            Arc::new(dispatch_db.clone()),
            tracing::info_span!("dispatch_status"),
        )
        .consumer_app()?,
        NotificationService::new(Arc::new(sender.clone()), tracing::info_span!("notification"))
            .consumer_app()?,
        InboxService::new(Arc::new(inbox.clone()), tracing::info_span!("inbox")).consumer_app()?,
    ];
    let groups: Vec<ConsumerGroup> = apps
        .into_iter()
        .map(|app| {
            let span = tracing::info_span!("consumer", queue = %app.queue());
            ConsumerGroup::spawn(
                Arc::new(app),
                Arc::clone(&broker_port),
                Arc::clone(&idempotency),
                &consumer_config,
                span,
                token.clone(),
            )
        })
        .collect();

    // (E) Message を作成（最後の 1 件は検証エラーになる）
    let create = CreateMessageHandler::new(
        Arc::new(dispatch_db.clone()),
        Arc::clone(&ids),
        Arc::clone(&clock),
        tracing::info_span!("create_message"),
    );
    let requests = [
        NewMessage::new("alice", "bob", "Lunch at noon?"),
        NewMessage::new("alice", "carol", "Parcel at the front desk")
            .with_delivery_address("desk-3"),
        NewMessage::new("bob", "dave", "Call me back").with_delivery_address("bounce:dave"),
        NewMessage::new("carol", "flaky", "Retry me"),
        NewMessage::new("dave", "   ", "nobody to deliver to"),
    ];
    let mut created = Vec::new();
    for request in requests {
        match create.handle(request).await {
            Ok(message) => {
                println!("created: {} ({} -> {})", message.id, message.originator, message.recipient);
                created.push(message.id);
            }
            Err(e) => println!("rejected: {e}"),
        }
    }

    // (F) 全件が終端状態になるか、タイムアウトか、Ctrl-C まで待つ
    let deadline = Instant::now() + Duration::from_secs(30);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("interrupted"),
        _ = async {
            while Instant::now() < deadline {
                let open = dispatch_db.find_by_status(MessageStatus::Created).await.map_or(0, |m| m.len())
                    + dispatch_db.find_by_status(MessageStatus::InProgress).await.map_or(0, |m| m.len());
                if open == 0 {
                    break;
                }
                sleep(Duration::from_millis(100)).await;
            }
        } => {}
    }
    // 最後の outbox（通知と inbox の command）が流れきるのを少し待つ
    sleep(relay_config.poll_interval * 3).await;

    // (G) 集計を出力
    let now = clock.now();
    let mut messages = Vec::new();
    for id in &created {
        if let Some(message) = MessageStore::get(&dispatch_db, *id).await? {
            messages.push((message.id.to_string(), message.recipient, message.status));
        }
    }
    let mut inbox_entries = 0;
    for recipient in ["bob", "carol", "dave", "flaky"] {
        inbox_entries += inbox.entries_for(recipient).await?.len();
    }
    let summary = Summary {
        messages,
        dispatch_outbox: dispatch_db.counts(now).await?,
        delivery_outbox: delivery_db.counts(now).await?,
        inbox_entries,
        notifications_sent: sender.sent(),
        dead_letters: broker.dead_letter_counts().await,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    // (H) graceful shutdown
    token.cancel();
    for group in groups {
        group.shutdown_and_join().await;
    }
    for relay in relays {
        relay.await?;
    }
    Ok(())
}
