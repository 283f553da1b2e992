//! Mutations: one-off writes with lifecycle hooks.
//!
//! Unlike queries, mutations are never deduplicated and are not retried unless
//! a retry policy is opted into, because a side-effecting write repeated by
//! accident can create the same resource twice.
//!
//! Hooks run in a fixed order: `on_mutate` before the mutation function, then
//! `on_success` or `on_error`, then `on_settled` exactly once.
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
//! let create_post = Mutation::with_hooks(
//!     |title: String| async move { Ok::<_, QueryError>(title.len()) },
//!     MutationHooks::new().on_success({
//!         let client = client.clone();
//!         move |_id: &usize, _title: &String, _ctx: Option<&()>| {
//!             client.invalidate_queries(QueryFilters::exact(query_key!["posts"]));
//!         }
//!     }),
//! );
//!
//! let id = create_post.mutate_async("Hello".to_string()).await?;
//! assert_eq!(id, 5);
//! assert!(create_post.state().is_success());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::QueryError;

/// The state of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState<T> {
    /// Mutation is idle (not yet started, or reset).
    Idle,
    /// Mutation is in progress.
    Pending,
    /// Mutation succeeded with a result.
    Success(T),
    /// Mutation failed with an error.
    Error(QueryError),
}

impl<T> MutationState<T> {
    /// Returns the result data if the mutation succeeded, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    pub const fn error(&self) -> Option<&QueryError> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns `true` if the mutation is currently running.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

type MutateHook<V, C> = Box<dyn Fn(&V) -> C + Send + Sync>;
type SuccessHook<V, R, C> = Box<dyn Fn(&R, &V, Option<&C>) + Send + Sync>;
type ErrorHook<V, C> = Box<dyn Fn(&QueryError, &V, Option<&C>) + Send + Sync>;
type SettledHook<V, R, C> = Box<dyn Fn(Option<&R>, Option<&QueryError>, &V, Option<&C>) + Send + Sync>;

/// Optional lifecycle callbacks for a [`Mutation`].
///
/// `C` is the context returned by `on_mutate` and handed to the later hooks,
/// for example to roll back an optimistic update.
pub struct MutationHooks<V, R, C = ()> {
    on_mutate: Option<MutateHook<V, C>>,
    on_success: Option<SuccessHook<V, R, C>>,
    on_error: Option<ErrorHook<V, C>>,
    on_settled: Option<SettledHook<V, R, C>>,
}

impl<V, R, C> Default for MutationHooks<V, R, C> {
    fn default() -> Self {
        Self {
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<V, R, C> MutationHooks<V, R, C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs before the mutation function. Its return value becomes the context.
    #[must_use]
    pub fn on_mutate(mut self, f: impl Fn(&V) -> C + Send + Sync + 'static) -> Self {
        self.on_mutate = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_success(mut self, f: impl Fn(&R, &V, Option<&C>) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_error(
        mut self,
        f: impl Fn(&QueryError, &V, Option<&C>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Runs last, once per run, whatever the outcome.
    #[must_use]
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&R>, Option<&QueryError>, &V, Option<&C>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Box::new(f));
        self
    }
}

struct MutationInner<V, R, C> {
    mutation_fn: Box<dyn Fn(V) -> BoxFuture<'static, Result<R, QueryError>> + Send + Sync>,
    hooks: MutationHooks<V, R, C>,
    retry: RetryPolicy,
    state: watch::Sender<MutationState<R>>,
    latest_run: AtomicU64,
}

/// A write operation with hooks and observable state.
///
/// Cloning a `Mutation` shares its hooks and state. Concurrent runs proceed
/// independently; the observable state follows the most recently started run.
pub struct Mutation<V, R, C = ()> {
    inner: Arc<MutationInner<V, R, C>>,
}

impl<V, R, C> Clone for Mutation<V, R, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, R, C> fmt::Debug for Mutation<V, R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("retry", &self.inner.retry)
            .field("runs", &self.inner.latest_run.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<V, R> Mutation<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Creates a mutation without hooks.
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, QueryError>> + Send + 'static,
    {
        Self::with_hooks(mutation_fn, MutationHooks::new())
    }
}

impl<V, R, C> Mutation<V, R, C>
where
    V: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Creates a mutation with lifecycle hooks.
    pub fn with_hooks<F, Fut>(mutation_fn: F, hooks: MutationHooks<V, R, C>) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, QueryError>> + Send + 'static,
    {
        Self::with_options(mutation_fn, hooks, RetryPolicy::NONE)
    }

    /// Creates a mutation that retries failed runs. Only use this for idempotent writes.
    pub fn with_options<F, Fut>(
        mutation_fn: F,
        hooks: MutationHooks<V, R, C>,
        retry: RetryPolicy,
    ) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, QueryError>> + Send + 'static,
    {
        let (state, _) = watch::channel(MutationState::Idle);
        Self {
            inner: Arc::new(MutationInner {
                mutation_fn: Box::new(move |variables| mutation_fn(variables).boxed()),
                hooks,
                retry,
                state,
                latest_run: AtomicU64::new(0),
            }),
        }
    }

    /// Current state of the most recently started run.
    pub fn state(&self) -> MutationState<R> {
        self.inner.state.borrow().clone()
    }

    /// Receives every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<MutationState<R>> {
        self.inner.state.subscribe()
    }

    /// Returns the state to [`MutationState::Idle`].
    pub fn reset(&self) {
        self.inner.latest_run.fetch_add(1, Ordering::AcqRel);
        self.inner.state.send_replace(MutationState::Idle);
    }

    /// Runs the mutation once with `variables`, invoking the hooks in order.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed attempt after `on_error` and `on_settled`
    /// have run.
    pub async fn run(&self, variables: V) -> Result<R, QueryError> {
        let inner = &self.inner;
        let run_id = inner.latest_run.fetch_add(1, Ordering::AcqRel) + 1;
        self.publish(run_id, MutationState::Pending);

        let context = inner.hooks.on_mutate.as_ref().map(|f| f(&variables));

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match (inner.mutation_fn)(variables.clone()).await {
                Ok(result) => break Ok(result),
                Err(error) if error.is_retryable() && inner.retry.should_retry(attempt) => {
                    let delay = inner.retry.delay_for(attempt);
                    debug!(attempt, ?delay, %error, "Mutation attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => break Err(error),
            }
        };

        match &result {
            Ok(data) => {
                if let Some(on_success) = &inner.hooks.on_success {
                    on_success(data, &variables, context.as_ref());
                }
            }
            Err(error) => {
                debug!(%error, attempts = attempt, "Mutation failed");
                if let Some(on_error) = &inner.hooks.on_error {
                    on_error(error, &variables, context.as_ref());
                }
            }
        }
        if let Some(on_settled) = &inner.hooks.on_settled {
            on_settled(
                result.as_ref().ok(),
                result.as_ref().err(),
                &variables,
                context.as_ref(),
            );
        }

        self.publish(
            run_id,
            match &result {
                Ok(data) => MutationState::Success(data.clone()),
                Err(error) => MutationState::Error(error.clone()),
            },
        );
        result
    }

    /// Same as [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns the error of the failed attempt.
    pub async fn mutate_async(&self, variables: V) -> Result<R, QueryError> {
        self.run(variables).await
    }

    /// Starts a run in the background.
    ///
    /// The outcome is delivered through the hooks and [`state`](Self::state).
    /// Must be called from within a Tokio runtime.
    pub fn mutate(&self, variables: V) {
        let mutation = self.clone();
        tokio::spawn(async move {
            let _ = mutation.run(variables).await;
        });
    }

    fn publish(&self, run_id: u64, state: MutationState<R>) {
        if self.inner.latest_run.load(Ordering::Acquire) == run_id {
            self.inner.state.send_replace(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_mutation_state_data() {
        assert_eq!(MutationState::Success(42).data(), Some(&42));
        assert_eq!(MutationState::<i32>::Idle.data(), None);
        assert_eq!(MutationState::<i32>::Pending.data(), None);

        let error = MutationState::<i32>::Error(QueryError::MutationError("x".to_string()));
        assert_eq!(error.data(), None);
        assert_eq!(
            error.error(),
            Some(&QueryError::MutationError("x".to_string()))
        );
    }

    #[test]
    fn test_mutation_state_predicates() {
        let idle: MutationState<i32> = MutationState::Idle;
        assert!(idle.is_idle());
        assert!(!idle.is_pending());
        assert!(!idle.is_success());
        assert!(!idle.is_error());

        let pending: MutationState<i32> = MutationState::Pending;
        assert!(pending.is_pending());

        let success = MutationState::Success(42);
        assert!(success.is_success());
        assert!(!success.is_error());

        let error: MutationState<i32> = MutationState::Error(QueryError::Cancelled);
        assert!(error.is_error());
        assert!(!error.is_success());
    }

    #[tokio::test]
    async fn test_hook_order_on_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = {
            let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
            MutationHooks::new()
                .on_mutate(move |v: &i32| {
                    a.lock().unwrap().push(format!("mutate {v}"));
                    "ctx"
                })
                .on_success(move |r: &i32, _v: &i32, ctx: Option<&&str>| {
                    b.lock().unwrap().push(format!("success {r} {}", ctx.unwrap()));
                })
                .on_error(move |_e, _v, _ctx| {
                    c.lock().unwrap().push("error".to_string());
                })
                .on_settled(move |r, e, _v, _ctx| {
                    d.lock()
                        .unwrap()
                        .push(format!("settled {:?} {}", r, e.is_some()));
                })
        };
        let mutation = Mutation::with_hooks(|v: i32| async move { Ok(v * 2) }, hooks);

        assert_eq!(mutation.run(21).await, Ok(42));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "mutate 21".to_string(),
                "success 42 ctx".to_string(),
                "settled Some(42) false".to_string(),
            ]
        );
        assert_eq!(mutation.state(), MutationState::Success(42));
    }

    #[tokio::test]
    async fn test_error_is_returned_and_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let settled = Arc::new(AtomicUsize::new(0));

        let mutation = Mutation::with_hooks(
            {
                let calls = calls.clone();
                move |_: ()| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(QueryError::MutationError("rejected".to_string())) }
                }
            },
            MutationHooks::<(), (), ()>::new()
                .on_error({
                    let errors = errors.clone();
                    move |_e, _v, ctx| {
                        assert!(ctx.is_none());
                        errors.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .on_settled({
                    let settled = settled.clone();
                    move |_r, _e, _v, _ctx| {
                        settled.fetch_add(1, Ordering::SeqCst);
                    }
                }),
        );

        let result = mutation.mutate_async(()).await;
        assert_eq!(
            result,
            Err(QueryError::MutationError("rejected".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(settled.load(Ordering::SeqCst), 1);
        assert!(mutation.state().is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opt_in_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mutation = Mutation::with_options(
            {
                let calls = calls.clone();
                move |_: ()| {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if attempt < 2 {
                            Err(QueryError::NetworkError("flaky".to_string()))
                        } else {
                            Ok(attempt)
                        }
                    }
                }
            },
            MutationHooks::<(), usize, ()>::new(),
            RetryPolicy::new(
                3,
                std::time::Duration::from_millis(10),
                std::time::Duration::from_secs(1),
            ),
        );

        assert_eq!(mutation.run(()).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mutate_fire_and_forget() {
        let mutation = Mutation::new(|v: u32| async move { Ok(v + 1) });
        let mut state = mutation.subscribe_state();

        mutation.mutate(1);
        let settled = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            state.wait_for(|s| s.is_success()),
        )
        .await
        .expect("mutation should settle within timeout")
        .expect("state channel should stay open")
        .clone();
        assert_eq!(settled, MutationState::Success(2));

        mutation.reset();
        assert!(mutation.state().is_idle());
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mutation = Mutation::new({
            let calls = calls.clone();
            move |v: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(v) }
            }
        });

        let (a, b) = tokio::join!(mutation.run(7), mutation.run(7));
        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
