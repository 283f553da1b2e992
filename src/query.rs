//! Query client, snapshots and observers.
//!
//! The [`QueryClient`] is the single entry point to the cache. Callers never hold
//! entries directly: they pass keys and receive [`QuerySnapshot`]s, so every read
//! goes through the cache logic.
//!
//! # Example
//!
//! ```rust
//! use qcache::prelude::*;
//! use qcache::query_key;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//!
//! let posts = client
//!     .fetch_query(query_key!["posts"], |_ctx| async {
//!         Ok(vec!["Getting Started with Rust".to_string()])
//!     })
//!     .await?;
//! assert_eq!(posts.len(), 1);
//!
//! // Cached: the second read does not call the fetch function.
//! let cached = client.get_query_data::<Vec<String>>(query_key!["posts"]);
//! assert_eq!(cached.as_deref(), Some(&*posts));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::cache::{EntrySnapshot, ErasedData, ErasedFetcher, QueryCache, structural_eq};
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::fetch::{FetchContext, FetchCoordinator, FetchOptions, FetchRequest};
use crate::key::{QueryFilters, QueryKey};
use crate::online::OnlineManager;

/// Whether a query has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data yet and no attempt has finished.
    Pending,
    /// The last attempt failed. Earlier data may still be present.
    Error,
    /// Data is available.
    Success,
}

/// Whether a query is currently running its fetch function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    /// The query wanted to fetch but is waiting for connectivity.
    Paused,
}

/// The observable state of a query.
#[derive(Debug)]
pub struct QuerySnapshot<T> {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    /// Last successful result. Kept when a later fetch fails.
    pub data: Option<Arc<T>>,
    pub error: Option<QueryError>,
    /// When data was last written.
    pub updated_at: Option<Instant>,
    /// Whether the data has been invalidated and awaits a refetch.
    pub is_stale: bool,
}

impl<T> Clone for QuerySnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
            is_stale: self.is_stale,
        }
    }
}

impl<T: Send + Sync + 'static> QuerySnapshot<T> {
    fn from_entry(entry: &EntrySnapshot, hash: &str) -> Self {
        let mut snapshot = Self {
            status: entry.status,
            fetch_status: entry.fetch_status,
            data: None,
            error: entry.error.clone(),
            updated_at: entry.updated_at,
            is_stale: entry.is_invalidated,
        };
        if let Some(data) = entry.data.clone() {
            match data.downcast::<T>() {
                Ok(data) => snapshot.data = Some(data),
                Err(_) => {
                    snapshot.status = QueryStatus::Error;
                    snapshot.error = Some(QueryError::TypeMismatch(hash.to_owned()));
                }
            }
        }
        snapshot
    }
}

impl<T> QuerySnapshot<T> {
    /// Returns the data if any was cached, even alongside an error.
    pub fn data(&self) -> Option<&T> {
        self.data.as_deref()
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    pub const fn is_fetching(&self) -> bool {
        matches!(self.fetch_status, FetchStatus::Fetching)
    }

    pub const fn is_paused(&self) -> bool {
        matches!(self.fetch_status, FetchStatus::Paused)
    }

    /// Returns `true` for the first load: no data yet and a fetch running.
    pub const fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }
}

/// A client for managing the query cache.
///
/// The `QueryClient` owns every cache entry and coordinates fetches, invalidation
/// and garbage collection. Clones share the same cache.
///
/// # Example
///
/// ```rust
/// use qcache::{QueryClient, QueryConfig};
/// use std::time::Duration;
///
/// let config = QueryConfig::new(
///     Some(Duration::from_secs(30)), // stale_time
///     Duration::from_secs(300),      // gc_time
/// );
///
/// let client = QueryClient::with_config(config);
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    cache: Arc<QueryCache>,
    coordinator: FetchCoordinator,
    online: OnlineManager,
    config: QueryConfig,
    disposed: AtomicBool,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &self.inner.cache.len())
            .field("config", &self.inner.config)
            .field("online", &self.inner.online.is_online())
            .finish_non_exhaustive()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self::with_online_manager(config, OnlineManager::new())
    }

    /// Creates a client whose fetches pause while `online` reports offline.
    #[must_use]
    pub fn with_online_manager(config: QueryConfig, online: OnlineManager) -> Self {
        let cache = QueryCache::new(config.gc_time);
        let coordinator = FetchCoordinator::new(cache.clone(), online.clone(), config.clone());
        Self {
            inner: Arc::new(ClientInner {
                cache,
                coordinator,
                online,
                config,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    pub fn online_manager(&self) -> &OnlineManager {
        &self.inner.online
    }

    /// Returns `true` once [`dispose`](Self::dispose) has been called on this client or a clone.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Validates `key` and returns its canonical form.
    fn resolve(&self, key: &QueryKey) -> Result<String, QueryError> {
        if self.is_disposed() {
            return Err(QueryError::Disposed);
        }
        key.canonicalize()
    }

    /// Returns a snapshot of `key`, fetching first if it is absent or stale.
    ///
    /// Concurrent calls for the same key share one fetch. A fetch that exhausts
    /// its retries is reported through the snapshot's `status` and `error`, not
    /// as an `Err`.
    ///
    /// # Errors
    ///
    /// Fails fast with [`QueryError::InvalidKey`] for a malformed key and
    /// [`QueryError::Disposed`] after [`dispose`](Self::dispose).
    pub async fn ensure_fresh<T, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: FetchOptions,
    ) -> Result<QuerySnapshot<T>, QueryError>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let key = key.into();
        let hash = self.resolve(&key)?;
        let entry = self
            .inner
            .coordinator
            .ensure_fresh(FetchRequest {
                key: &key,
                hash: &hash,
                fetcher: Some(erase_fetcher(fetcher)),
                data_eq: Some(structural_eq::<T>),
                options: &options,
            })
            .await;
        Ok(QuerySnapshot::from_entry(&entry, &hash))
    }

    /// Like [`ensure_fresh`](Self::ensure_fresh), but returns the data or the error.
    ///
    /// # Errors
    ///
    /// Returns the error of the last failed attempt, [`QueryError::Cancelled`] if
    /// the fetch was aborted before any data arrived, or a key error.
    pub async fn fetch_query<T, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
    ) -> Result<Arc<T>, QueryError>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let snapshot = self
            .ensure_fresh(key, fetcher, FetchOptions::default())
            .await?;
        match (snapshot.status, snapshot.data, snapshot.error) {
            (QueryStatus::Error, _, Some(error)) => Err(error),
            (_, Some(data), _) => Ok(data),
            (_, None, error) => Err(error.unwrap_or(QueryError::Cancelled)),
        }
    }

    /// Warms the cache for `key`. Failures are recorded in the entry, not returned.
    pub async fn prefetch_query<T, F, Fut>(&self, key: impl Into<QueryKey>, fetcher: F)
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        if let Err(error) = self
            .ensure_fresh(key, fetcher, FetchOptions::default())
            .await
        {
            debug!(%error, "Prefetch skipped");
        }
    }

    /// Returns the cached data for `key`, if any of type `T`.
    pub fn get_query_data<T>(&self, key: impl Into<QueryKey>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get_query_state::<T>(key).and_then(|s| s.data)
    }

    /// Returns a snapshot of `key` without fetching.
    pub fn get_query_state<T>(&self, key: impl Into<QueryKey>) -> Option<QuerySnapshot<T>>
    where
        T: Send + Sync + 'static,
    {
        let hash = self.resolve(&key.into()).ok()?;
        self.inner
            .cache
            .get(&hash)
            .map(|entry| QuerySnapshot::from_entry(&entry, &hash))
    }

    /// Seeds the cache for `key` and notifies its subscribers.
    ///
    /// Data deep-equal to what is already cached keeps the cached reference.
    ///
    /// # Errors
    ///
    /// Fails for a malformed key or a disposed client.
    pub fn set_query_data<T>(&self, key: impl Into<QueryKey>, data: T) -> Result<Arc<T>, QueryError>
    where
        T: PartialEq + Send + Sync + 'static,
    {
        let key = key.into();
        let hash = self.resolve(&key)?;
        let entry = self
            .inner
            .cache
            .set(&key, &hash, Arc::new(data), structural_eq::<T>);
        QuerySnapshot::<T>::from_entry(&entry, &hash)
            .data
            .ok_or(QueryError::TypeMismatch(hash))
    }

    /// Marks matching entries stale and refetches the ones currently observed.
    ///
    /// Unobserved entries refetch on their next read. Returns the number of
    /// refetches started.
    pub fn invalidate_queries(&self, filters: impl Into<QueryFilters>) -> usize {
        if self.is_disposed() {
            return 0;
        }
        let active = self.inner.cache.invalidate(&filters.into());
        let options = FetchOptions::new().force_refetch();
        for (hash, key) in &active {
            self.inner.coordinator.trigger(FetchRequest {
                key,
                hash,
                fetcher: None,
                data_eq: None,
                options: &options,
            });
        }
        active.len()
    }

    /// Refetches every matching entry that has a fetch function and waits for all of them.
    pub async fn refetch_queries(&self, filters: impl Into<QueryFilters>) {
        if self.is_disposed() {
            return;
        }
        let matching = self.inner.cache.matching(&filters.into());
        let options = FetchOptions::new().force_refetch();
        let coordinator = &self.inner.coordinator;
        join_all(matching.iter().map(|(hash, key)| {
            coordinator.ensure_fresh(FetchRequest {
                key,
                hash,
                fetcher: None,
                data_eq: None,
                options: &options,
            })
        }))
        .await;
    }

    /// Aborts in-flight fetches of matching entries without recording an error.
    pub fn cancel_queries(&self, filters: impl Into<QueryFilters>) -> usize {
        if self.is_disposed() {
            return 0;
        }
        self.inner.cache.cancel(&filters.into())
    }

    /// Removes matching entries from the cache.
    ///
    /// Subscriptions on a removed entry stop receiving changes; subscribing again
    /// creates a fresh entry.
    pub fn remove_queries(&self, filters: impl Into<QueryFilters>) -> usize {
        if self.is_disposed() {
            return 0;
        }
        self.inner.cache.remove(&filters.into())
    }

    /// Number of matching entries with a fetch in flight.
    pub fn is_fetching(&self, filters: impl Into<QueryFilters>) -> usize {
        if self.is_disposed() {
            return 0;
        }
        self.inner.cache.fetching(&filters.into())
    }

    /// Number of live subscriptions on `key`.
    pub fn subscriber_count(&self, key: impl Into<QueryKey>) -> usize {
        self.resolve(&key.into())
            .map_or(0, |hash| self.inner.cache.subscriber_count(&hash))
    }

    /// Removes every entry. The client stays usable.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    /// Clears the cache and rejects further use of this client and its clones.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.cache.clear();
        debug!("Query client disposed");
    }

    /// Registers interest in `key`, keeping its entry from being garbage collected.
    ///
    /// # Errors
    ///
    /// Fails for a malformed key or a disposed client.
    pub fn subscribe(&self, key: impl Into<QueryKey>) -> Result<QuerySubscription, QueryError> {
        let key = key.into();
        let hash = self.resolve(&key)?;
        let (entry_id, changes) = self.inner.cache.subscribe(&key, &hash);
        Ok(QuerySubscription {
            cache: self.inner.cache.clone(),
            key,
            hash,
            entry_id,
            changes,
            active: true,
        })
    }

    /// Ends a subscription. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: QuerySubscription) {
        drop(subscription);
    }

    /// Subscribes to `key` and starts fetching it if needed.
    ///
    /// The observer sees every state change of the entry, including refetches
    /// triggered by [`invalidate_queries`](Self::invalidate_queries).
    ///
    /// # Errors
    ///
    /// Fails for a malformed key or a disposed client.
    pub fn observe<T, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: FetchOptions,
    ) -> Result<QueryObserver<T>, QueryError>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let subscription = self.subscribe(key)?;
        let fetcher = erase_fetcher(fetcher);
        self.inner.coordinator.trigger(FetchRequest {
            key: &subscription.key,
            hash: &subscription.hash,
            fetcher: Some(fetcher.clone()),
            data_eq: Some(structural_eq::<T>),
            options: &options,
        });
        Ok(QueryObserver {
            client: self.clone(),
            fetcher,
            options,
            subscription,
            _marker: PhantomData,
        })
    }
}

fn erase_fetcher<T, F, Fut>(fetcher: F) -> ErasedFetcher
where
    T: Send + Sync + 'static,
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
{
    Arc::new(move |context| {
        fetcher(context)
            .map(|result| result.map(|data| Arc::new(data) as ErasedData))
            .boxed()
    })
}

/// A caller's registration of interest in a key.
///
/// Dropping the subscription unsubscribes. When the last subscription on a key
/// goes away, the entry is garbage collected after the configured delay.
pub struct QuerySubscription {
    cache: Arc<QueryCache>,
    key: QueryKey,
    hash: String,
    entry_id: u64,
    changes: watch::Receiver<EntrySnapshot>,
    active: bool,
}

impl QuerySubscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Waits for the next change of the entry.
    ///
    /// Returns `false` once the entry has been removed from the cache.
    pub async fn changed(&mut self) -> bool {
        self.changes.changed().await.is_ok()
    }

    /// Current state of the entry as type `T`.
    pub fn snapshot<T: Send + Sync + 'static>(&self) -> QuerySnapshot<T> {
        QuerySnapshot::from_entry(&self.changes.borrow(), &self.hash)
    }
}

impl fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("key", &self.hash)
            .finish_non_exhaustive()
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        if std::mem::take(&mut self.active) {
            self.cache.unsubscribe(&self.hash, self.entry_id);
        }
    }
}

/// A live view of one query, as a UI component would hold it.
///
/// # Example
///
/// ```rust
/// use qcache::prelude::*;
/// use qcache::query_key;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), QueryError> {
/// let client = QueryClient::new();
/// let mut posts = client.observe(
///     query_key!["posts"],
///     |_ctx| async { Ok(vec![1, 2, 3]) },
///     FetchOptions::default(),
/// )?;
///
/// while !posts.snapshot().is_success() {
///     posts.changed().await;
/// }
/// assert_eq!(posts.snapshot().data(), Some(&vec![1, 2, 3]));
/// # Ok(())
/// # }
/// ```
pub struct QueryObserver<T> {
    client: QueryClient,
    fetcher: ErasedFetcher,
    options: FetchOptions,
    subscription: QuerySubscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T> QueryObserver<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    pub fn key(&self) -> &QueryKey {
        self.subscription.key()
    }

    pub fn snapshot(&self) -> QuerySnapshot<T> {
        self.subscription.snapshot()
    }

    /// Waits for the next change and returns the new snapshot.
    ///
    /// Returns `None` once the entry has been removed from the cache.
    pub async fn changed(&mut self) -> Option<QuerySnapshot<T>> {
        self.subscription
            .changed()
            .await
            .then(|| self.subscription.snapshot())
    }

    /// Fetches again regardless of freshness and returns the settled snapshot.
    pub async fn refetch(&self) -> QuerySnapshot<T> {
        let entry = self
            .client
            .inner
            .coordinator
            .ensure_fresh(FetchRequest {
                key: &self.subscription.key,
                hash: &self.subscription.hash,
                fetcher: Some(self.fetcher.clone()),
                data_eq: Some(structural_eq::<T>),
                options: &self.options.clone().force_refetch(),
            })
            .await;
        QuerySnapshot::from_entry(&entry, &self.subscription.hash)
    }

    /// Turns the observer into a stream of snapshots, starting with the current one.
    ///
    /// The subscription stays alive for as long as the stream does.
    pub fn into_stream(self) -> BoxStream<'static, QuerySnapshot<T>> {
        let changes = self.subscription.changes.clone();
        let subscription = self.subscription;
        // Capturing a field of a `Drop` type moves the whole subscription into the closure.
        WatchStream::new(changes)
            .map(move |entry| QuerySnapshot::from_entry(&entry, &subscription.hash))
            .boxed()
    }
}

impl<T> fmt::Debug for QueryObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
