//! Prelude module for convenient imports.
//!
//! ```
//! use qcache::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The query cache
//! - [`QueryKey`] and [`QueryFilters`] - Identifying and selecting entries
//! - [`FetchContext`] and [`FetchOptions`] - Fetch function input and per-call options
//! - [`Mutation`] and [`MutationHooks`] - Writes with lifecycle hooks
//! - [`QueryError`] - The error type shared by queries and mutations

pub use crate::config::{QueryConfig, RetryPolicy};
pub use crate::error::QueryError;
pub use crate::fetch::{FetchContext, FetchOptions};
pub use crate::key::{KeySegment, KeyValue, QueryFilters, QueryKey};
pub use crate::mutation::{Mutation, MutationHooks, MutationState};
pub use crate::query::{FetchStatus, QueryClient, QueryObserver, QuerySnapshot, QueryStatus};
