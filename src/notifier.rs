//! Provider change-event consumer.
//!
//! Receives "mailbox changed" events from a broker subscription, drops
//! duplicates and stale redeliveries per user, and fans the rest out: a live
//! event to open connections immediately, then a push notification enriched
//! with the latest message off the receive loop. Receipt is acknowledged
//! right after the dedup decision, so a downstream failure can never cause a
//! redelivery storm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::gmail::MailboxClient;
use crate::models::{ChangeEvent, MessageSummary, PushNotification};

/// Sink for the fire-and-forget indexing trigger. Enqueueing is one-way;
/// nothing downstream reports back into this engine.
#[async_trait]
pub trait IndexSink: Send + Sync {
    async fn enqueue(&self, user_id: i64, message: &MessageSummary);
}

/// Used when semantic indexing is not wired up.
pub struct NullIndexer;

#[async_trait]
impl IndexSink for NullIndexer {
    async fn enqueue(&self, _user_id: i64, _message: &MessageSummary) {}
}

/// A single delivery from the broker. Acknowledgment is explicit and
/// idempotent; dropping an un-acked delivery leaves redelivery up to the
/// broker.
pub struct EventDelivery {
    pub event: ChangeEvent,
    ack_tx: Option<oneshot::Sender<()>>,
}

impl EventDelivery {
    pub fn ack(&mut self) {
        if let Some(tx) = self.ack_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A broker subscription delivering mailbox-changed events.
#[async_trait]
pub trait EventSource: Send {
    /// Provisions whatever the subscription needs before the first receive.
    /// An error here disables the consumer gracefully; it is not fatal to
    /// the process.
    async fn ensure_subscription(&self) -> Result<()>;

    /// The next delivery, or `None` once the source is closed.
    async fn next(&mut self) -> Option<EventDelivery>;
}

/// Publishing half of the in-process event channel. The request layer
/// decodes provider pushes and publishes them here.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<EventDelivery>,
}

impl EventPublisher {
    /// Publishes one event. The returned receiver resolves when the
    /// consumer acknowledges it.
    pub async fn publish(&self, event: ChangeEvent) -> Result<oneshot::Receiver<()>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(EventDelivery {
                event,
                ack_tx: Some(ack_tx),
            })
            .await
            .map_err(|_| anyhow::anyhow!("change event consumer is gone"))?;
        Ok(ack_rx)
    }
}

pub struct ChannelSource {
    rx: mpsc::Receiver<EventDelivery>,
}

pub fn channel_source(capacity: usize) -> (EventPublisher, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventPublisher { tx }, ChannelSource { rx })
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn ensure_subscription(&self) -> Result<()> {
        Ok(())
    }

    async fn next(&mut self) -> Option<EventDelivery> {
        self.rx.recv().await
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct WatchPayload {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: u64,
}

/// Decodes the base64 `data` field of a Gmail watch notification as the
/// broker delivers it: `{"emailAddress": ..., "historyId": ...}`.
pub fn decode_push_data(data: &str) -> Result<ChangeEvent, DecodeError> {
    let trimmed = data.trim();
    let bytes = general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))?;
    let payload: WatchPayload = serde_json::from_slice(&bytes)?;
    Ok(ChangeEvent {
        address: payload.email_address,
        history_id: payload.history_id,
    })
}

/// Last-seen history id per user.
///
/// The whole read-compare-write runs under one lock. Brokers deliver
/// concurrently and redeliver at will; comparing and storing in two steps
/// would let two deliveries of the same event both pass the check.
#[derive(Default)]
pub struct DedupState {
    last_seen: Mutex<HashMap<i64, u64>>,
}

impl DedupState {
    /// Records `history_id` for the user. Returns `false` for a duplicate or
    /// stale id; a higher out-of-order id is always accepted.
    pub fn advance(&self, user_id: i64, history_id: u64) -> bool {
        let mut map = self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let last = map.entry(user_id).or_insert(0);
        if history_id <= *last {
            return false;
        }
        *last = history_id;
        true
    }
}

pub struct ChangeNotifier {
    db: Arc<Database>,
    dispatch: Arc<Dispatcher>,
    mailbox: Option<Arc<dyn MailboxClient>>,
    indexer: Arc<dyn IndexSink>,
    dedup: DedupState,
    enrichment: Arc<Semaphore>,
    fetch_timeout: Duration,
}

impl ChangeNotifier {
    pub fn new(
        db: Arc<Database>,
        dispatch: Arc<Dispatcher>,
        mailbox: Option<Arc<dyn MailboxClient>>,
        indexer: Arc<dyn IndexSink>,
        enrichment_concurrency: usize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            db,
            dispatch,
            mailbox,
            indexer,
            dedup: DedupState::default(),
            enrichment: Arc::new(Semaphore::new(enrichment_concurrency)),
            fetch_timeout,
        }
    }

    pub async fn run<S: EventSource>(self: Arc<Self>, mut source: S, cancel: CancellationToken) {
        if let Err(err) = source.ensure_subscription().await {
            warn!(error = %err, "change event subscription unavailable, consumer disabled");
            return;
        }
        info!("change event consumer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = source.next() => {
                    match delivery {
                        Some(mut delivery) => self.handle(&mut delivery).await,
                        None => break,
                    }
                }
            }
        }
        info!("change event consumer stopped");
    }

    async fn handle(self: &Arc<Self>, delivery: &mut EventDelivery) {
        let event = delivery.event.clone();

        let user_id = match self.db.user_id_for_address(&event.address).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                // Not an error: the mailbox may belong to an unregistered
                // tenant.
                debug!(address = %event.address, "event for unknown mailbox, dropping");
                delivery.ack();
                return;
            }
            Err(err) => {
                warn!(address = %event.address, error = %err, "user lookup failed, dropping event");
                delivery.ack();
                return;
            }
        };

        if !self.dedup.advance(user_id, event.history_id) {
            debug!(
                user_id,
                history_id = event.history_id,
                "duplicate or stale event, dropping"
            );
            delivery.ack();
            return;
        }

        // Dedup state has advanced; a redelivery would be dropped anyway, so
        // acknowledge before any fan-out work.
        delivery.ack();

        self.dispatch.notify_user(
            user_id,
            "new_mail",
            serde_json::json!({
                "address": &event.address,
                "historyId": event.history_id,
                "timestamp": chrono::Utc::now().timestamp(),
            }),
        );

        // Enrichment and push dispatch run off the receive loop. The permit
        // bounds how many are in flight; a burst past the cap backpressures
        // the receive loop here rather than exhausting the runtime.
        let Ok(permit) = self.enrichment.clone().acquire_owned().await else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            this.push_new_mail(user_id, &event.address).await;
        });
    }

    async fn push_new_mail(&self, user_id: i64, address: &str) {
        if !self.dispatch.push_enabled() {
            return;
        }
        let tokens = match self.db.push_tokens(user_id).await {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(user_id, error = %err, "push token lookup failed");
                return;
            }
        };
        if tokens.is_empty() {
            return;
        }

        let summary = self.fetch_latest(address).await;
        let notification = match &summary {
            Some(message) => {
                let sender = message
                    .from_name
                    .clone()
                    .or_else(|| message.from_address.clone())
                    .unwrap_or_else(|| "Someone".to_string());
                PushNotification {
                    title: format!("New email from {}", sender),
                    body: message
                        .subject
                        .clone()
                        .unwrap_or_else(|| "(no subject)".to_string()),
                    data: serde_json::json!({"messageId": message.id}),
                }
            }
            None => PushNotification {
                title: "New email".to_string(),
                body: "You have new mail".to_string(),
                data: serde_json::Value::Null,
            },
        };

        if let Some(message) = &summary {
            self.indexer.enqueue(user_id, message).await;
        }

        let token_strings: Vec<String> = tokens.into_iter().map(|t| t.token).collect();
        match self.dispatch.push_to_devices(&token_strings, &notification).await {
            Ok(invalid) if !invalid.is_empty() => {
                match self.db.delete_push_tokens(user_id, &invalid).await {
                    Ok(()) => info!(user_id, count = invalid.len(), "pruned invalid push tokens"),
                    Err(err) => warn!(user_id, error = %err, "failed to prune push tokens"),
                }
            }
            Ok(_) => {}
            Err(err) => warn!(user_id, error = %err, "push dispatch failed"),
        }
    }

    /// Best-effort latest-message peek, bounded so a stuck provider call
    /// cannot pin an enrichment permit forever.
    async fn fetch_latest(&self, address: &str) -> Option<MessageSummary> {
        let client = self.mailbox.as_ref()?;
        match timeout(self.fetch_timeout, client.latest_message(address)).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(err)) => {
                debug!(error = %err, "latest message fetch failed, sending generic notification");
                None
            }
            Err(_) => {
                debug!("latest message fetch timed out, sending generic notification");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    use crate::testutil::{FakeMailbox, FakePush, RecordingIndexer};

    struct Harness {
        publisher: EventPublisher,
        cancel: CancellationToken,
        db: Arc<Database>,
        dispatch: Arc<Dispatcher>,
        push: Arc<FakePush>,
        indexer: Arc<RecordingIndexer>,
        user: i64,
    }

    async fn harness(mailbox: Option<Arc<dyn MailboxClient>>) -> Harness {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let user = db.insert_user("alice@example.com").await.unwrap();
        let push = Arc::new(FakePush::default());
        let dispatch = Arc::new(Dispatcher::new(Some(push.clone())));
        let indexer = Arc::new(RecordingIndexer::default());
        let notifier = Arc::new(ChangeNotifier::new(
            db.clone(),
            dispatch.clone(),
            mailbox,
            indexer.clone(),
            4,
            Duration::from_millis(200),
        ));

        let (publisher, source) = channel_source(16);
        let cancel = CancellationToken::new();
        tokio::spawn(notifier.run(source, cancel.clone()));

        Harness {
            publisher,
            cancel,
            db,
            dispatch,
            push,
            indexer,
            user,
        }
    }

    async fn publish_and_ack(harness: &Harness, history_id: u64) {
        let ack = harness
            .publisher
            .publish(ChangeEvent {
                address: "alice@example.com".to_string(),
                history_id,
            })
            .await
            .unwrap();
        ack.await.unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn dedup_accepts_only_strictly_newer_ids() {
        let dedup = DedupState::default();
        assert!(dedup.advance(1, 5));
        assert!(!dedup.advance(1, 5)); // duplicate
        assert!(!dedup.advance(1, 4)); // stale
        assert!(dedup.advance(1, 7)); // out-of-order but newer
        assert!(dedup.advance(2, 1)); // other users are independent
    }

    #[tokio::test]
    async fn duplicate_and_stale_events_fan_out_once() {
        let h = harness(None).await;
        let mut live = h.dispatch.subscribe(h.user);

        publish_and_ack(&h, 5).await;
        publish_and_ack(&h, 5).await;
        publish_and_ack(&h, 4).await;

        let first = live.recv().await.unwrap();
        assert_eq!(first.event, "new_mail");
        assert_eq!(first.data["historyId"], 5);
        assert!(live.try_recv().is_err());

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn newer_out_of_order_events_are_accepted() {
        let h = harness(None).await;
        let mut live = h.dispatch.subscribe(h.user);

        publish_and_ack(&h, 5).await;
        publish_and_ack(&h, 7).await;

        assert_eq!(live.recv().await.unwrap().data["historyId"], 5);
        assert_eq!(live.recv().await.unwrap().data["historyId"], 7);

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_mailboxes_are_acked_and_dropped() {
        let h = harness(None).await;
        let mut live = h.dispatch.subscribe(h.user);

        let ack = h
            .publisher
            .publish(ChangeEvent {
                address: "stranger@example.com".to_string(),
                history_id: 9,
            })
            .await
            .unwrap();
        ack.await.unwrap();

        assert!(live.try_recv().is_err());
        assert_eq!(h.push.call_count(), 0);

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn push_is_enriched_with_the_latest_message() {
        let mailbox = Arc::new(FakeMailbox::with_message("bob@example.com", "Lunch?"));
        let h = harness(Some(mailbox)).await;
        h.db.add_push_token(h.user, "tok-a", None).await.unwrap();

        publish_and_ack(&h, 5).await;
        wait_until(|| h.push.call_count() == 1).await;

        let calls = h.push.calls();
        assert_eq!(calls[0].1.title, "New email from bob@example.com");
        assert_eq!(calls[0].1.body, "Lunch?");
        // Enrichment success also queues the message for indexing.
        assert_eq!(h.indexer.enqueued(), vec![(h.user, "msg-latest".to_string())]);

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn enrichment_failure_falls_back_to_a_generic_push() {
        let mailbox = Arc::new(FakeMailbox::failing());
        let h = harness(Some(mailbox)).await;
        h.db.add_push_token(h.user, "tok-a", None).await.unwrap();

        publish_and_ack(&h, 5).await;
        wait_until(|| h.push.call_count() == 1).await;

        let calls = h.push.calls();
        assert_eq!(calls[0].1.title, "New email");
        assert_eq!(calls[0].1.body, "You have new mail");
        assert!(h.indexer.enqueued().is_empty());

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn no_tokens_means_no_push_attempt() {
        let mailbox = Arc::new(FakeMailbox::with_message("bob@example.com", "Lunch?"));
        let h = harness(Some(mailbox)).await;

        publish_and_ack(&h, 5).await;
        // Give the enrichment task room to run if it were (wrongly) spawned.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.push.call_count(), 0);
        assert!(h.indexer.enqueued().is_empty());

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn invalid_tokens_are_pruned_after_fan_out() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let user = db.insert_user("alice@example.com").await.unwrap();
        db.add_push_token(user, "tok-dead", None).await.unwrap();
        db.add_push_token(user, "tok-live", None).await.unwrap();

        let push = Arc::new(FakePush::reporting_invalid(&["tok-dead"]));
        let dispatch = Arc::new(Dispatcher::new(Some(push.clone())));
        let notifier = Arc::new(ChangeNotifier::new(
            db.clone(),
            dispatch,
            None,
            Arc::new(NullIndexer),
            4,
            Duration::from_millis(200),
        ));
        let (publisher, source) = channel_source(16);
        let cancel = CancellationToken::new();
        tokio::spawn(notifier.run(source, cancel.clone()));

        let ack = publisher
            .publish(ChangeEvent {
                address: "alice@example.com".to_string(),
                history_id: 3,
            })
            .await
            .unwrap();
        ack.await.unwrap();
        wait_until(|| push.call_count() == 1).await;

        let mut remaining = db.push_tokens(user).await.unwrap();
        for _ in 0..200 {
            if remaining.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            remaining = db.push_tokens(user).await.unwrap();
        }
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].token, "tok-live");

        cancel.cancel();
    }

    #[test]
    fn decode_push_data_parses_the_watch_payload() {
        let payload = general_purpose::STANDARD
            .encode(r#"{"emailAddress":"alice@example.com","historyId":42}"#);
        let event = decode_push_data(&payload).unwrap();
        assert_eq!(event.address, "alice@example.com");
        assert_eq!(event.history_id, 42);
    }

    #[test]
    fn decode_push_data_rejects_garbage() {
        assert!(matches!(
            decode_push_data("!!not base64!!"),
            Err(DecodeError::Base64(_))
        ));
        let not_json = general_purpose::STANDARD.encode("hello");
        assert!(matches!(
            decode_push_data(&not_json),
            Err(DecodeError::Json(_))
        ));
    }
}
