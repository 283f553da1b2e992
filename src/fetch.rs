//! Fetch coordination: deduplication, retries, cancellation and pausing.
//!
//! Every entry has at most one fetch in flight. Callers asking for the same key
//! while it runs attach to the same shared future instead of calling the fetch
//! function again. The fetch is driven by a detached task, so it completes and
//! caches its result even if every caller stops waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{
    DataEq, EntrySnapshot, ErasedFetcher, FetchOutcome, InFlightFetch, QueryCache, SharedFetch,
};
use crate::config::{QueryConfig, RetryPolicy};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::online::OnlineManager;
use crate::query::FetchStatus;

/// Context passed to every fetch function call.
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// The key being fetched, so one function can serve a family of keys.
    pub key: QueryKey,
    /// Cancelled when the fetch is aborted or superseded.
    pub signal: CancellationToken,
}

/// Per-call options for reading a query.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub force_refetch: bool,
    /// Overrides the client's stale time for this call.
    pub stale_time: Option<Duration>,
    /// Overrides the client's retry policy for fetches started by this call.
    pub retry: Option<RetryPolicy>,
    /// Overrides how long the entry is retained once unobserved.
    pub gc_time: Option<Duration>,
    /// Aborts a fetch started by this call when cancelled.
    pub signal: Option<CancellationToken>,
}

impl FetchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn force_refetch(mut self) -> Self {
        self.force_refetch = true;
        self
    }

    #[must_use]
    pub const fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub const fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    #[must_use]
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// A read request for one entry.
pub(crate) struct FetchRequest<'a> {
    pub key: &'a QueryKey,
    pub hash: &'a str,
    /// `None` reuses the fetch function last registered for the entry.
    pub fetcher: Option<ErasedFetcher>,
    pub data_eq: Option<DataEq>,
    pub options: &'a FetchOptions,
}

enum Begin {
    Fresh(EntrySnapshot),
    Pending(u64, SharedFetch),
}

/// Starts, joins and settles fetches against the entry store.
pub(crate) struct FetchCoordinator {
    cache: Arc<QueryCache>,
    online: OnlineManager,
    config: QueryConfig,
    next_fetch_id: AtomicU64,
}

impl FetchCoordinator {
    pub fn new(cache: Arc<QueryCache>, online: OnlineManager, config: QueryConfig) -> Self {
        Self {
            cache,
            online,
            config,
            next_fetch_id: AtomicU64::new(1),
        }
    }

    /// Returns a fresh snapshot of the entry, fetching first if it is absent or stale.
    ///
    /// Attaches to an in-flight fetch when one exists. If the awaited fetch gets
    /// superseded by a newer one, waits for the newer one instead.
    pub async fn ensure_fresh(&self, request: FetchRequest<'_>) -> EntrySnapshot {
        let hash = request.hash.to_owned();
        let (mut id, mut future) = match self.begin(request) {
            Begin::Fresh(snapshot) => return snapshot,
            Begin::Pending(id, future) => (id, future),
        };
        loop {
            let _waiter = Waiter::join(&self.cache, &hash, id);
            let outcome = future.await;
            if matches!(outcome, Err(QueryError::Cancelled))
                && let Some((next_id, next)) = self.cache.in_flight(&hash)
                && next_id != id
            {
                id = next_id;
                future = next;
                continue;
            }
            return self
                .cache
                .get(&hash)
                .unwrap_or_else(|| EntrySnapshot::from_outcome(outcome));
        }
    }

    /// Starts a fetch in the background if the entry needs one. Does not wait.
    pub fn trigger(&self, request: FetchRequest<'_>) {
        let _ = self.begin(request);
    }

    fn begin(&self, request: FetchRequest<'_>) -> Begin {
        let FetchRequest {
            key,
            hash,
            fetcher,
            data_eq,
            options,
        } = request;

        let mut entry = self.cache.entry_mut(key, hash);
        if let Some(fetcher) = fetcher {
            entry.fetcher = Some(fetcher);
        }
        if let Some(data_eq) = data_eq {
            entry.data_eq = Some(data_eq);
        }
        if let Some(gc_time) = options.gc_time {
            entry.gc_time = gc_time;
        }

        if !options.force_refetch
            && let Some(in_flight) = entry.in_flight.as_ref()
        {
            debug!(key = %hash, fetch_id = in_flight.id, "Joining in-flight fetch");
            return Begin::Pending(in_flight.id, in_flight.future.clone());
        }

        let stale_time = options.stale_time.or(self.config.stale_time);
        if !options.force_refetch && !entry.needs_fetch(stale_time) {
            return Begin::Fresh(entry.snapshot());
        }
        let Some(fetcher) = entry.fetcher.clone() else {
            debug!(key = %hash, "No fetch function registered, nothing to refetch");
            return Begin::Fresh(entry.snapshot());
        };

        if let Some(previous) = entry.in_flight.take() {
            debug!(key = %hash, fetch_id = previous.id, "Superseding in-flight fetch");
            previous.cancel.cancel();
        }

        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let cancel = options
            .signal
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let job = FetchJob {
            cache: Arc::downgrade(&self.cache),
            online: self.online.clone(),
            key: key.clone(),
            hash: hash.to_owned(),
            id,
            fetcher,
            cancel: cancel.clone(),
            retry: options.retry.unwrap_or(self.config.retry),
        };
        let future = job.run().boxed().shared();

        entry.in_flight = Some(InFlightFetch {
            id,
            future: future.clone(),
            cancel,
            waiters: 0,
        });
        entry.fetch_status = FetchStatus::Fetching;
        entry.notify();
        drop(entry);

        debug!(key = %hash, fetch_id = id, "Starting fetch");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(future.clone());
        }
        Begin::Pending(id, future)
    }
}

/// Counts a caller awaiting a fetch for as long as it waits.
struct Waiter<'a> {
    cache: &'a QueryCache,
    hash: &'a str,
    id: u64,
}

impl<'a> Waiter<'a> {
    fn join(cache: &'a QueryCache, hash: &'a str, id: u64) -> Self {
        cache.add_waiters(hash, id, 1);
        Self { cache, hash, id }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.cache.add_waiters(self.hash, self.id, -1);
    }
}

/// One fetch, including its retries.
struct FetchJob {
    cache: Weak<QueryCache>,
    online: OnlineManager,
    key: QueryKey,
    hash: String,
    id: u64,
    fetcher: ErasedFetcher,
    cancel: CancellationToken,
    retry: RetryPolicy,
}

impl FetchJob {
    async fn run(self) -> FetchOutcome {
        let outcome = self.attempt().await;
        if let Some(cache) = self.cache.upgrade() {
            cache.settle(&self.hash, self.id, &outcome);
        }
        outcome
    }

    async fn attempt(&self) -> FetchOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if !self.online.is_online() {
                debug!(key = %self.hash, "Fetch paused until connectivity returns");
                self.set_status(FetchStatus::Paused);
                tokio::select! {
                    () = self.online.wait_online() => {}
                    () = self.cancel.cancelled() => return Err(QueryError::Cancelled),
                }
                self.set_status(FetchStatus::Fetching);
            }

            let context = FetchContext {
                key: self.key.clone(),
                signal: self.cancel.clone(),
            };
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(QueryError::Cancelled),
                result = (self.fetcher)(context) => result,
            };

            match result {
                Ok(data) => {
                    debug!(key = %self.hash, attempt, "Fetch succeeded");
                    return Ok(data);
                }
                Err(error) if error.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(key = %self.hash, attempt, ?delay, %error, "Fetch attempt failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => return Err(QueryError::Cancelled),
                    }
                }
                Err(QueryError::Cancelled) => {
                    debug!(key = %self.hash, "Fetch cancelled");
                    return Err(QueryError::Cancelled);
                }
                Err(error) => {
                    warn!(key = %self.hash, attempts = attempt, %error, "Fetch failed");
                    return Err(error);
                }
            }
        }
    }

    fn set_status(&self, fetch_status: FetchStatus) {
        if let Some(cache) = self.cache.upgrade() {
            cache.set_fetch_status(&self.hash, self.id, fetch_status);
        }
    }
}
