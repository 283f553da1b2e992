//! Entry store: cached results, lifecycle state and garbage collection.
//!
//! Entries are keyed by canonical key string and hold type-erased data so one
//! store can serve queries of any value type. Typed access happens at the
//! [`QueryClient`](crate::query::QueryClient) boundary.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::QueryError;
use crate::fetch::FetchContext;
use crate::key::{QueryFilters, QueryKey};
use crate::query::{FetchStatus, QueryStatus};

pub(crate) type ErasedData = Arc<dyn Any + Send + Sync>;
pub(crate) type FetchOutcome = Result<ErasedData, QueryError>;
pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;
pub(crate) type ErasedFetcher =
    Arc<dyn Fn(FetchContext) -> BoxFuture<'static, FetchOutcome> + Send + Sync>;

/// Deep equality on two erased values of the same concrete type.
pub(crate) type DataEq = fn(&ErasedData, &ErasedData) -> bool;

/// [`DataEq`] for values of type `T`.
pub(crate) fn structural_eq<T: PartialEq + 'static>(a: &ErasedData, b: &ErasedData) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Point-in-time view of an entry, broadcast to subscribers on every change.
#[derive(Debug, Clone)]
pub(crate) struct EntrySnapshot {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data: Option<ErasedData>,
    pub error: Option<QueryError>,
    pub updated_at: Option<Instant>,
    pub is_invalidated: bool,
}

impl EntrySnapshot {
    const fn pending() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            updated_at: None,
            is_invalidated: false,
        }
    }

    /// Snapshot for a fetch whose entry was removed before it settled.
    pub fn from_outcome(outcome: FetchOutcome) -> Self {
        match outcome {
            Ok(data) => Self {
                status: QueryStatus::Success,
                data: Some(data),
                updated_at: Some(Instant::now()),
                ..Self::pending()
            },
            Err(QueryError::Cancelled) => Self::pending(),
            Err(error) => Self {
                status: QueryStatus::Error,
                error: Some(error),
                ..Self::pending()
            },
        }
    }
}

/// The single fetch currently running for an entry.
pub(crate) struct InFlightFetch {
    pub id: u64,
    pub future: SharedFetch,
    pub cancel: CancellationToken,
    pub waiters: usize,
}

struct GcTimer {
    id: u64,
    cancel: CancellationToken,
}

/// A cached entry with its status and subscribers.
pub(crate) struct CacheEntry {
    /// Distinguishes this entry from earlier ones stored under the same key.
    pub id: u64,
    pub key: QueryKey,
    pub data: Option<ErasedData>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub error: Option<QueryError>,
    pub updated_at: Option<Instant>,
    pub is_invalidated: bool,
    pub subscriber_count: usize,
    pub gc_time: Duration,
    pub in_flight: Option<InFlightFetch>,
    /// Last fetch function registered for this key, used by background refetches.
    pub fetcher: Option<ErasedFetcher>,
    pub data_eq: Option<DataEq>,
    gc_timer: Option<GcTimer>,
    notifier: watch::Sender<EntrySnapshot>,
}

impl CacheEntry {
    fn new(id: u64, key: QueryKey, gc_time: Duration) -> Self {
        let (notifier, _) = watch::channel(EntrySnapshot::pending());
        Self {
            id,
            key,
            data: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            error: None,
            updated_at: None,
            is_invalidated: false,
            subscriber_count: 0,
            gc_time,
            in_flight: None,
            fetcher: None,
            data_eq: None,
            gc_timer: None,
            notifier,
        }
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
            is_invalidated: self.is_invalidated,
        }
    }

    /// Publishes the current state to every subscriber.
    pub fn notify(&self) {
        self.notifier.send_replace(self.snapshot());
    }

    /// Returns `true` if the entry is absent data, invalidated, or older than `stale_time`.
    pub fn needs_fetch(&self, stale_time: Option<Duration>) -> bool {
        if self.data.is_none() || self.is_invalidated {
            return true;
        }
        match (stale_time, self.updated_at) {
            (Some(stale_time), Some(updated_at)) => updated_at.elapsed() >= stale_time,
            _ => false,
        }
    }

    /// Stores a successful result.
    ///
    /// If the new value is deep-equal to the stored one, the stored reference is kept.
    pub fn apply_data(&mut self, data: ErasedData) {
        let data = match (&self.data, self.data_eq) {
            (Some(current), Some(eq)) if eq(current, &data) => current.clone(),
            _ => data,
        };
        self.data = Some(data);
        self.status = QueryStatus::Success;
        self.error = None;
        self.updated_at = Some(Instant::now());
        self.is_invalidated = false;
    }

    /// Records a failure, leaving previously cached data in place.
    pub fn apply_error(&mut self, error: QueryError) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.gc_timer.take() {
            timer.cancel.cancel();
        }
    }

    fn is_collectable(&self, timer_id: u64) -> bool {
        self.subscriber_count == 0
            && self.in_flight.is_none()
            && self.gc_timer.as_ref().is_some_and(|t| t.id == timer_id)
    }
}

/// Process-wide store of cache entries.
pub(crate) struct QueryCache {
    entries: DashMap<String, CacheEntry>,
    default_gc_time: Duration,
    next_entry_id: AtomicU64,
    next_timer_id: AtomicU64,
    this: Weak<Self>,
}

impl QueryCache {
    pub fn new(default_gc_time: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            entries: DashMap::new(),
            default_gc_time,
            next_entry_id: AtomicU64::new(0),
            next_timer_id: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, hash: &str) -> Option<EntrySnapshot> {
        self.entries.get(hash).map(|entry| entry.snapshot())
    }

    pub fn subscriber_count(&self, hash: &str) -> usize {
        self.entries.get(hash).map_or(0, |entry| entry.subscriber_count)
    }

    /// Returns the entry for `hash`, creating a pending one if absent.
    ///
    /// The returned guard locks a shard of the map: never hold it across an await.
    pub fn entry_mut(&self, key: &QueryKey, hash: &str) -> RefMut<'_, String, CacheEntry> {
        self.entries.entry(hash.to_owned()).or_insert_with(|| {
            let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
            CacheEntry::new(id, key.clone(), self.default_gc_time)
        })
    }

    /// Sets successful data for a key and notifies subscribers.
    pub fn set(
        &self,
        key: &QueryKey,
        hash: &str,
        data: ErasedData,
        data_eq: DataEq,
    ) -> EntrySnapshot {
        let mut entry = self.entry_mut(key, hash);
        entry.data_eq = Some(data_eq);
        entry.apply_data(data);
        entry.notify();
        self.schedule_gc(hash, &mut entry);
        entry.snapshot()
    }

    /// Registers interest in a key, cancelling any pending garbage collection.
    ///
    /// Returns the id of the entry subscribed to, which [`unsubscribe`](Self::unsubscribe)
    /// must be given back.
    pub fn subscribe(
        &self,
        key: &QueryKey,
        hash: &str,
    ) -> (u64, watch::Receiver<EntrySnapshot>) {
        let mut entry = self.entry_mut(key, hash);
        entry.subscriber_count += 1;
        entry.cancel_timers();
        (entry.id, entry.notifier.subscribe())
    }

    /// Drops interest in entry `entry_id`; the last unsubscribe schedules garbage collection.
    ///
    /// Does nothing if that entry has since been removed, even when a newer entry
    /// now lives under the same key.
    pub fn unsubscribe(&self, hash: &str, entry_id: u64) {
        let Some(mut entry) = self.entries.get_mut(hash) else {
            return;
        };
        if entry.id != entry_id {
            debug!(key = %hash, "Ignoring unsubscribe from a removed entry");
            return;
        }
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        self.schedule_gc(hash, &mut entry);
    }

    /// Marks matching entries stale.
    ///
    /// Returns the keys of matching entries that currently have subscribers; only
    /// those should be refetched right away.
    pub fn invalidate(&self, filters: &QueryFilters) -> Vec<(String, QueryKey)> {
        let mut active = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if !filters.matches(&entry.key) {
                continue;
            }
            entry.is_invalidated = true;
            entry.notify();
            if entry.subscriber_count > 0 {
                active.push((entry.key().clone(), entry.key.clone()));
            }
        }
        debug!(active = active.len(), "Invalidated queries");
        active
    }

    pub fn matching(&self, filters: &QueryFilters) -> Vec<(String, QueryKey)> {
        self.entries
            .iter()
            .filter(|entry| filters.matches(&entry.key))
            .map(|entry| (entry.key().clone(), entry.key.clone()))
            .collect()
    }

    /// Number of matching entries with a fetch in flight.
    pub fn fetching(&self, filters: &QueryFilters) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.in_flight.is_some() && filters.matches(&entry.key))
            .count()
    }

    /// Aborts in-flight fetches of matching entries. Returns how many were cancelled.
    pub fn cancel(&self, filters: &QueryFilters) -> usize {
        let mut cancelled = 0;
        for entry in self.entries.iter() {
            if let Some(in_flight) = entry.in_flight.as_ref()
                && filters.matches(&entry.key)
            {
                in_flight.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Removes matching entries, aborting their fetches. Returns how many were removed.
    pub fn remove(&self, filters: &QueryFilters) -> usize {
        let hashes: Vec<String> = self
            .matching(filters)
            .into_iter()
            .map(|(hash, _)| hash)
            .collect();
        let mut removed = 0;
        for hash in hashes {
            if let Some((_, mut entry)) = self.entries.remove(&hash) {
                entry.cancel_timers();
                if let Some(in_flight) = entry.in_flight.take() {
                    in_flight.cancel.cancel();
                }
                removed += 1;
            }
        }
        removed
    }

    pub fn in_flight(&self, hash: &str) -> Option<(u64, SharedFetch)> {
        self.entries.get(hash).and_then(|entry| {
            entry
                .in_flight
                .as_ref()
                .map(|in_flight| (in_flight.id, in_flight.future.clone()))
        })
    }

    /// Adjusts the number of callers awaiting fetch `fetch_id`, if it is still current.
    pub fn add_waiters(&self, hash: &str, fetch_id: u64, delta: isize) {
        if let Some(mut entry) = self.entries.get_mut(hash)
            && let Some(in_flight) = entry.in_flight.as_mut()
            && in_flight.id == fetch_id
        {
            in_flight.waiters = in_flight.waiters.saturating_add_signed(delta);
        }
    }

    /// Updates the fetch status while fetch `fetch_id` is still current.
    pub fn set_fetch_status(&self, hash: &str, fetch_id: u64, fetch_status: FetchStatus) {
        if let Some(mut entry) = self.entries.get_mut(hash)
            && entry.in_flight.as_ref().is_some_and(|f| f.id == fetch_id)
        {
            entry.fetch_status = fetch_status;
            entry.notify();
        }
    }

    /// Writes the outcome of fetch `fetch_id` into its entry.
    ///
    /// Outcomes of superseded fetches are ignored, so an entry always reflects the
    /// most recently started fetch. Cancelled fetches leave data and error untouched.
    pub fn settle(&self, hash: &str, fetch_id: u64, outcome: &FetchOutcome) {
        let Some(mut entry) = self.entries.get_mut(hash) else {
            debug!(key = %hash, fetch_id, "Entry removed before fetch settled");
            return;
        };
        if entry.in_flight.as_ref().is_none_or(|f| f.id != fetch_id) {
            debug!(key = %hash, fetch_id, "Ignoring superseded fetch");
            return;
        }
        entry.in_flight = None;
        entry.fetch_status = FetchStatus::Idle;
        match outcome {
            Ok(data) => entry.apply_data(data.clone()),
            Err(QueryError::Cancelled) => {}
            Err(error) => entry.apply_error(error.clone()),
        }
        entry.notify();
        self.schedule_gc(hash, &mut entry);
    }

    /// Starts the eviction timer for an entry nobody observes.
    fn schedule_gc(&self, hash: &str, entry: &mut CacheEntry) {
        if entry.subscriber_count > 0 || entry.gc_timer.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key = %hash, "No runtime available, garbage collection not scheduled");
            return;
        };

        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        entry.gc_timer = Some(GcTimer {
            id,
            cancel: cancel.clone(),
        });

        let cache = self.this.clone();
        let hash = hash.to_owned();
        let delay = entry.gc_time;
        runtime.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(cache) = cache.upgrade() {
                        cache.collect(&hash, id);
                    }
                }
            }
        });
    }

    fn collect(&self, hash: &str, timer_id: u64) {
        if self
            .entries
            .remove_if(hash, |_, entry| entry.is_collectable(timer_id))
            .is_some()
        {
            debug!(key = %hash, "Garbage collected inactive query");
            return;
        }
        // Still unobserved but busy fetching: try again after another full delay.
        if let Some(mut entry) = self.entries.get_mut(hash)
            && entry.subscriber_count == 0
            && entry.gc_timer.as_ref().is_some_and(|t| t.id == timer_id)
        {
            entry.gc_timer = None;
            self.schedule_gc(hash, &mut entry);
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.remove(&QueryFilters::all());
    }
}
