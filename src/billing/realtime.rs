//! Realtime invalidation of the subscription cache.
//!
//! A change feed pushes row-change events for one owner. The invalidator keeps
//! exactly one feed subscription open for the current session user and turns
//! every event into a cache revalidation. Event payloads are never applied:
//! the store stays the single source the cache reads from.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::backoff::backoff_delay;
use super::cache::SubscriptionCache;
use super::error::{BillingError, BillingResult};
use super::session::SessionContext;

/// Buffered events per feed subscription.
const FEED_BUFFER: usize = 64;
const RESUBSCRIBE_BASE_DELAY_MS: u64 = 1_000;
const RESUBSCRIBE_MAX_DELAY_MS: u64 = 60_000;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change to a subscription row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub owner_user_id: String,
    pub record_id: Option<String>,
    /// Row data as pushed by the feed, if any. Treated as untrusted.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, owner_user_id: impl Into<String>) -> Self {
        Self {
            kind,
            owner_user_id: owner_user_id.into(),
            record_id: None,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// An open, owner-filtered feed subscription.
#[derive(Debug)]
pub struct FeedSubscription {
    id: Uuid,
    owner_user_id: String,
    events: mpsc::Receiver<ChangeEvent>,
}

impl FeedSubscription {
    pub fn new(id: Uuid, owner_user_id: impl Into<String>, events: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            id,
            owner_user_id: owner_user_id.into(),
            events,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn owner_user_id(&self) -> &str {
        &self.owner_user_id
    }

    /// Next event, or `None` once the feed closed this subscription.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

/// Change-feed service filtered by `owner_user_id`.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription delivering events where `owner_user_id` matches.
    async fn subscribe(&self, owner_user_id: &str) -> BillingResult<FeedSubscription>;

    /// Close a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, subscription_id: Uuid);
}

/// In-process change feed.
///
/// Suitable for single-node deployments where the writer (webhook ingestion,
/// reconciliation) runs in the same process, and for tests.
#[derive(Clone, Default)]
pub struct InMemoryChangeFeed {
    /// Owner user id to open subscriptions
    subscribers: Arc<DashMap<String, Vec<(Uuid, mpsc::Sender<ChangeEvent>)>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryChangeFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every subscription for its owner.
    ///
    /// Returns the number of subscriptions it reached. A full buffer drops the
    /// event, since a revalidation is already queued behind it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let Some(mut senders) = self.subscribers.get_mut(&event.owner_user_id) else {
            return 0;
        };

        let mut delivered = 0;
        senders.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(target: "subscription_sync::realtime", subscription_id = %id, "Feed buffer full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Total open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Open subscriptions for one owner.
    #[must_use]
    pub fn subscriber_count_for(&self, owner_user_id: &str) -> usize {
        self.subscribers
            .get(owner_user_id)
            .map_or(0, |entry| entry.value().len())
    }

    /// Make `subscribe` fail, to simulate an outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(&self, owner_user_id: &str) -> BillingResult<FeedSubscription> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::ChangeFeedUnavailable {
                message: "in-memory feed marked unavailable".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let id = Uuid::new_v4();
        self.subscribers
            .entry(owner_user_id.to_string())
            .or_default()
            .push((id, tx));
        Ok(FeedSubscription::new(id, owner_user_id, rx))
    }

    async fn unsubscribe(&self, subscription_id: Uuid) {
        self.subscribers.retain(|_, senders| {
            senders.retain(|(id, _)| *id != subscription_id);
            !senders.is_empty()
        });
    }
}

/// Keeps one change-feed subscription open for the session user.
pub struct RealtimeInvalidator {
    session_rx: watch::Receiver<Option<String>>,
    feed: Arc<dyn ChangeFeed>,
    cache: SubscriptionCache,
    current: Option<FeedSubscription>,
    failures: u32,
    retry_at: Option<Instant>,
}

impl RealtimeInvalidator {
    /// Start the invalidator for `session`.
    ///
    /// Runs until the returned handle is shut down or dropped, or the session
    /// itself is dropped.
    pub fn spawn(
        session: SessionContext,
        feed: Arc<dyn ChangeFeed>,
        cache: SubscriptionCache,
    ) -> InvalidatorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let invalidator = Self {
            session_rx: session.subscribe(),
            feed,
            cache,
            current: None,
            failures: 0,
            retry_at: None,
        };
        let task = tokio::spawn(invalidator.run(shutdown_rx));
        InvalidatorHandle { shutdown_tx, task }
    }

    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(target: "subscription_sync::realtime", "Realtime invalidator started");

        let initial = self.session_rx.borrow_and_update().clone();
        self.switch_to(initial).await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                changed = self.session_rx.changed() => {
                    if changed.is_err() {
                        tracing::debug!(target: "subscription_sync::realtime", "Session dropped");
                        break;
                    }
                    let user = self.session_rx.borrow_and_update().clone();
                    self.switch_to(user).await;
                }
                event = next_event(&mut self.current) => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        tracing::warn!(target: "subscription_sync::realtime", "Change feed closed the subscription");
                        self.teardown().await;
                        self.schedule_retry();
                    }
                },
                _ = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    let user = self.session_rx.borrow().clone();
                    self.switch_to(user).await;
                }
            }
        }

        self.teardown().await;
        tracing::info!(target: "subscription_sync::realtime", "Realtime invalidator stopped");
    }

    /// Point the subscription at `user`. The old one is always closed first.
    async fn switch_to(&mut self, user: Option<String>) {
        let subscribed_to = self.current.as_ref().map(|s| s.owner_user_id());
        if subscribed_to.is_some() && subscribed_to == user.as_deref() {
            return;
        }

        self.teardown().await;
        self.retry_at = None;

        let Some(user) = user else {
            self.failures = 0;
            return;
        };

        match self.feed.subscribe(&user).await {
            Ok(subscription) => {
                tracing::info!(
                    target: "subscription_sync::realtime",
                    user_id = %user,
                    subscription_id = %subscription.id(),
                    "Subscribed to subscription changes"
                );
                self.failures = 0;
                self.current = Some(subscription);
            }
            Err(e) => {
                tracing::warn!(
                    target: "subscription_sync::realtime",
                    user_id = %user,
                    error = %e,
                    "Could not open change feed, relying on staleness window"
                );
                self.schedule_retry();
            }
        }
    }

    async fn on_event(&self, event: ChangeEvent) {
        let Some(current) = &self.current else {
            return;
        };
        if event.owner_user_id != current.owner_user_id() {
            tracing::debug!(
                target: "subscription_sync::realtime",
                owner_user_id = %event.owner_user_id,
                "Ignoring event for another owner"
            );
            return;
        }

        tracing::debug!(
            target: "subscription_sync::realtime",
            user_id = %event.owner_user_id,
            kind = ?event.kind,
            "Subscription changed, revalidating"
        );
        self.cache.revalidate(&event.owner_user_id).await;
    }

    async fn teardown(&mut self) {
        if let Some(subscription) = self.current.take() {
            self.feed.unsubscribe(subscription.id()).await;
            tracing::info!(
                target: "subscription_sync::realtime",
                user_id = %subscription.owner_user_id(),
                subscription_id = %subscription.id(),
                "Unsubscribed from subscription changes"
            );
        }
    }

    fn schedule_retry(&mut self) {
        let delay = backoff_delay(self.failures, RESUBSCRIBE_BASE_DELAY_MS, RESUBSCRIBE_MAX_DELAY_MS);
        self.failures = self.failures.saturating_add(1);
        self.retry_at = Some(Instant::now() + delay);
    }
}

async fn next_event(subscription: &mut Option<FeedSubscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.next_event().await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running invalidator. Dropping it stops the invalidator.
pub struct InvalidatorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl InvalidatorHandle {
    /// Stop the invalidator and wait for its subscription to close.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            tracing::error!(target: "subscription_sync::realtime", error = %e, "Invalidator task failed");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
