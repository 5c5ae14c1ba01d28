//! Staleness-bounded, per-user subscription cache.
//!
//! This is the only read path consumers use. Each user id owns one slot:
//!
//! - a fresh slot (younger than the staleness window) is served without
//!   touching the store
//! - a stale slot is served as-is while a background refetch runs
//! - the first fetch for a user is observed as `loading` with no data
//! - concurrent fetches for one user collapse into one store read
//! - a transient store error is retried once, then surfaced next to the last
//!   known data, which is never discarded because of an error
//!
//! Slots live in a bounded moka cache. Evicted slots are closed, so a fetch
//! that completes after eviction is discarded instead of written.

use futures::future::{BoxFuture, FutureExt, Shared};
use moka::future::Cache as MokaCache;
use moka::notification::RemovalCause;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::error::{BillingError, BillingResult};
use super::storage::{SubscriptionRecord, SubscriptionStore};
use crate::config::CacheConfig;

type InFlight = Shared<BoxFuture<'static, ()>>;

/// Snapshot of a user's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheView {
    /// Last successfully fetched record. `None` means no subscription, or not loaded yet.
    pub data: Option<SubscriptionRecord>,
    /// First fetch still in flight; `data` is not meaningful yet.
    pub loading: bool,
    /// At least one fetch has succeeded, so `data: None` really means no record.
    pub loaded: bool,
    /// A fetch is in flight, including background revalidation.
    pub refreshing: bool,
    /// Error of the most recent fetch, cleared by the next success.
    pub error: Option<BillingError>,
    /// Older than the staleness window.
    pub stale: bool,
}

/// Per-user subscription cache.
///
/// Cheap to clone; clones share slots and in-flight fetches.
#[derive(Clone)]
pub struct SubscriptionCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    store: Arc<dyn SubscriptionStore>,
    slots: MokaCache<String, Arc<Slot>>,
    staleness_window: Duration,
    retry_delay: Duration,
    store_reads: AtomicUsize,
}

struct Slot {
    user_id: String,
    state: Mutex<SlotState>,
    closed: AtomicBool,
}

#[derive(Default)]
struct SlotState {
    data: Option<SubscriptionRecord>,
    error: Option<BillingError>,
    /// At least one fetch has succeeded.
    loaded: bool,
    /// Completion time of the last successful fetch.
    checked_at: Option<Instant>,
    in_flight: Option<InFlight>,
    /// Fetch again once the in-flight one completes.
    rerun: bool,
}

impl Slot {
    fn new(user_id: String) -> Self {
        Self {
            user_id,
            state: Mutex::new(SlotState::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // state stays consistent across a panic elsewhere, so poisoning is ignored
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SlotState {
    fn is_stale(&self, window: Duration) -> bool {
        self.checked_at.is_none_or(|at| at.elapsed() >= window)
    }

    fn view(&self, window: Duration) -> CacheView {
        CacheView {
            data: self.data.clone(),
            loading: self.in_flight.is_some() && !self.loaded,
            loaded: self.loaded,
            refreshing: self.in_flight.is_some(),
            error: self.error.clone(),
            stale: self.is_stale(window),
        }
    }
}

impl SubscriptionCache {
    /// Create a cache reading from `store`.
    pub fn new(store: Arc<dyn SubscriptionStore>, config: &CacheConfig) -> Self {
        let slots = MokaCache::builder()
            .max_capacity(config.max_entries)
            .time_to_idle(config.idle_eviction())
            .eviction_listener(|_user_id, slot: Arc<Slot>, cause| {
                if !matches!(cause, RemovalCause::Replaced) {
                    slot.close();
                }
            })
            .build();

        Self {
            inner: Arc::new(CacheInner {
                store,
                slots,
                staleness_window: config.staleness_window(),
                retry_delay: config.retry_delay(),
                store_reads: AtomicUsize::new(0),
            }),
        }
    }

    /// Current view of a user's slot, starting a fetch if it is missing or stale.
    ///
    /// Never waits for the store. The first call for a user returns
    /// `loading: true` with no data.
    pub async fn get(&self, user_id: &str) -> CacheView {
        let slot = self.slot(user_id).await;
        let mut state = slot.lock();
        if state.in_flight.is_none() && state.is_stale(self.inner.staleness_window) {
            self.start_fetch(&slot, &mut state);
        }
        state.view(self.inner.staleness_window)
    }

    /// Like [`get`](Self::get), but waits for the first fetch of a user.
    ///
    /// Stale data is still returned immediately with a background refetch.
    pub async fn load(&self, user_id: &str) -> CacheView {
        let slot = self.slot(user_id).await;
        let pending = {
            let mut state = slot.lock();
            if state.checked_at.is_none() {
                Some(self.join_or_start(&slot, &mut state))
            } else {
                if state.in_flight.is_none() && state.is_stale(self.inner.staleness_window) {
                    self.start_fetch(&slot, &mut state);
                }
                None
            }
        };

        if let Some(fetch) = pending {
            fetch.await;
        }
        let view = slot.lock().view(self.inner.staleness_window);
        view
    }

    /// View of a user's slot without starting any fetch.
    pub async fn peek(&self, user_id: &str) -> Option<CacheView> {
        let slot = self.inner.slots.get(user_id).await?;
        let view = slot.lock().view(self.inner.staleness_window);
        Some(view)
    }

    /// Fetch now, ignoring the staleness window, and wait for the result.
    ///
    /// Callers arriving while a fetch is in flight attach to it.
    pub async fn refetch(&self, user_id: &str) -> CacheView {
        let slot = self.slot(user_id).await;
        let fetch = {
            let mut state = slot.lock();
            self.join_or_start(&slot, &mut state)
        };
        fetch.await;
        let view = slot.lock().view(self.inner.staleness_window);
        view
    }

    /// Mark a user's slot dirty and refetch in the background.
    ///
    /// If a fetch is already in flight it may have read before the change, so
    /// one more fetch is queued behind it.
    pub async fn revalidate(&self, user_id: &str) {
        let slot = self.slot(user_id).await;
        let mut state = slot.lock();
        if state.in_flight.is_some() {
            state.rerun = true;
        } else {
            self.start_fetch(&slot, &mut state);
        }
    }

    /// Drop a user's slot. An in-flight fetch for it will not be written.
    pub async fn evict(&self, user_id: &str) {
        if let Some(slot) = self.inner.slots.remove(user_id).await {
            slot.close();
            tracing::debug!(target: "subscription_sync::cache", user_id = user_id, "Evicted subscription slot");
        }
    }

    /// Drop every slot.
    pub fn clear(&self) {
        for (_, slot) in self.inner.slots.iter() {
            slot.close();
        }
        self.inner.slots.invalidate_all();
    }

    /// Number of store reads issued, retries included.
    #[must_use]
    pub fn store_reads(&self) -> usize {
        self.inner.store_reads.load(Ordering::SeqCst)
    }

    /// The configured staleness window.
    #[must_use]
    pub fn staleness_window(&self) -> Duration {
        self.inner.staleness_window
    }

    async fn slot(&self, user_id: &str) -> Arc<Slot> {
        let key = user_id.to_string();
        self.inner
            .slots
            .get_with(key.clone(), async move { Arc::new(Slot::new(key)) })
            .await
    }

    fn join_or_start(&self, slot: &Arc<Slot>, state: &mut SlotState) -> InFlight {
        match &state.in_flight {
            Some(fetch) => fetch.clone(),
            None => self.start_fetch(slot, state),
        }
    }

    /// Spawn a fetch for `slot`. Must be called with the slot locked.
    fn start_fetch(&self, slot: &Arc<Slot>, state: &mut SlotState) -> InFlight {
        let task = tokio::spawn(supervise_fetch(Arc::clone(&self.inner), Arc::clone(slot)));
        let fetch = async move {
            let _ = task.await;
        }
        .boxed()
        .shared();

        state.in_flight = Some(fetch.clone());
        fetch
    }
}

impl std::fmt::Debug for SubscriptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCache")
            .field("staleness_window", &self.inner.staleness_window)
            .field("slots", &self.inner.slots.entry_count())
            .finish_non_exhaustive()
    }
}

/// Run a fetch and release the slot if the fetch task dies, so a panicking
/// store cannot leave it in flight forever.
async fn supervise_fetch(inner: Arc<CacheInner>, slot: Arc<Slot>) {
    let task = tokio::spawn(run_fetch(inner, Arc::clone(&slot)));
    let Err(e) = task.await else {
        return;
    };

    tracing::error!(
        target: "subscription_sync::cache",
        user_id = %slot.user_id,
        error = %e,
        "Subscription fetch task failed"
    );
    let mut state = slot.lock();
    state.in_flight = None;
    state.rerun = false;
    if !slot.is_closed() {
        state.error = Some(BillingError::Internal {
            message: format!("subscription fetch task failed: {e}"),
        });
    }
}

async fn run_fetch(inner: Arc<CacheInner>, slot: Arc<Slot>) {
    loop {
        let result = inner.fetch_with_retry(&slot.user_id).await;

        let mut state = slot.lock();
        if slot.is_closed() {
            state.in_flight = None;
            tracing::debug!(
                target: "subscription_sync::cache",
                user_id = %slot.user_id,
                "Discarding fetch for evicted slot"
            );
            return;
        }

        match result {
            Ok(record) => {
                // failures leave checked_at alone so the next read retries
                state.checked_at = Some(Instant::now());
                state.data = record;
                state.error = None;
                state.loaded = true;
            }
            Err(e) => {
                tracing::warn!(
                    target: "subscription_sync::cache",
                    user_id = %slot.user_id,
                    error = %e,
                    kept_previous = state.data.is_some(),
                    "Subscription fetch failed"
                );
                state.error = Some(e);
            }
        }

        if std::mem::take(&mut state.rerun) {
            continue;
        }
        state.in_flight = None;
        return;
    }
}

impl CacheInner {
    async fn fetch_with_retry(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        tracing::debug!(target: "subscription_sync::cache", user_id = user_id, "Fetching subscription");
        self.store_reads.fetch_add(1, Ordering::SeqCst);

        match self.store.find_by_owner(user_id).await {
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    target: "subscription_sync::cache",
                    user_id = user_id,
                    error = %e,
                    retry_in_ms = self.retry_delay.as_millis() as u64,
                    "Transient store error, retrying once"
                );
                tokio::time::sleep(self.retry_delay).await;
                self.store_reads.fetch_add(1, Ordering::SeqCst);
                self.store.find_by_owner(user_id).await
            }
            other => other,
        }
    }
}
