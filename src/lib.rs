//! # qcache - an async query cache client
//!
//! qcache keeps the results of asynchronous reads in a shared in-memory cache,
//! in the style of SWR or TanStack Query. Callers identify data by a structured
//! [`QueryKey`] and supply the function that fetches it; the client takes care
//! of the rest.
//!
//! ## Architecture
//!
//! 1. **Key registry** ([`key`]): canonicalizes structured keys into stable identities
//! 2. **Entry store**: cached data, status, subscribers and garbage collection
//! 3. **Fetch coordinator** ([`fetch`]): deduplicates concurrent fetches, retries
//!    with exponential backoff, pauses while offline and honors cancellation
//! 4. **Mutation runner** ([`mutation`]): runs writes with lifecycle hooks, after
//!    which dependent queries are invalidated and refetched
//!
//! ## Core Components
//!
//! - [`QueryClient`](query::QueryClient): the cache, with an explicit `new` / `clear` / `dispose` lifecycle
//! - [`QueryObserver`](query::QueryObserver): a live subscription to one key
//! - [`Mutation`](mutation::Mutation): a write operation with hooks
//!
//! ## Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//!
//! use qcache::prelude::*;
//! use qcache::query_key;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Post {
//!     id: u32,
//!     title: String,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let posts = Arc::new(Mutex::new(vec![Post { id: 1, title: "A".into() }]));
//! let client = QueryClient::new();
//!
//! let fetch_posts = {
//!     let posts = posts.clone();
//!     move |_ctx: FetchContext| {
//!         let posts = posts.lock().unwrap().clone();
//!         async move { Ok(posts) }
//!     }
//! };
//!
//! let create_post = Mutation::with_hooks(
//!     {
//!         let posts = posts.clone();
//!         move |title: String| {
//!             let mut posts = posts.lock().unwrap();
//!             let post = Post { id: posts.len() as u32 + 1, title };
//!             posts.push(post.clone());
//!             async move { Ok(post) }
//!         }
//!     },
//!     MutationHooks::new().on_success({
//!         let client = client.clone();
//!         move |_post: &Post, _title: &String, _ctx: Option<&()>| {
//!             client.invalidate_queries(QueryFilters::prefix(query_key!["posts"]));
//!         }
//!     }),
//! );
//!
//! let list = client.fetch_query(query_key!["posts"], fetch_posts.clone()).await?;
//! assert_eq!(list.len(), 1);
//!
//! create_post.mutate_async("B".to_string()).await?;
//!
//! let list = client.fetch_query(query_key!["posts"], fetch_posts).await?;
//! assert_eq!(list.len(), 2);
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod key;
pub mod mutation;
pub mod online;
pub mod prelude;
pub mod query;

pub use config::{QueryConfig, RetryPolicy};
pub use error::QueryError;
pub use fetch::{FetchContext, FetchOptions};
pub use key::{KeySegment, KeyValue, QueryFilters, QueryKey};
pub use mutation::{Mutation, MutationHooks, MutationState};
pub use online::OnlineManager;
pub use query::{
    FetchStatus, QueryClient, QueryObserver, QueryStatus, QuerySnapshot, QuerySubscription,
};
