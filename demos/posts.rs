//! Posts list example demonstrating queries, prefetching and mutations.
//!
//! This example shows:
//! - Fetching a list of posts with caching and retries
//! - Prefetching a single post before it is needed
//! - Creating a post with a mutation and invalidating the list afterwards
//! - Observing the list as it refetches in the background
//!
//! The backend is an in-memory list with an artificial delay.
//!
//! Run with: `RUST_LOG=qcache=debug cargo run --example posts`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use qcache::prelude::*;
use qcache::query_key;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
struct Post {
    id: u32,
    title: String,
}

/// Mock API with posts stored in memory.
#[derive(Clone)]
struct Api {
    posts: Arc<Mutex<Vec<Post>>>,
}

impl Api {
    fn new() -> Self {
        let titles = [
            "Getting Started with Rust",
            "Mastering Async in 2024",
            "Understanding Tokio: A Beginner's Guide",
        ];
        let posts = titles
            .iter()
            .zip(1..)
            .map(|(title, id)| Post {
                id,
                title: (*title).to_string(),
            })
            .collect();
        Self {
            posts: Arc::new(Mutex::new(posts)),
        }
    }

    async fn list(&self) -> Result<Vec<Post>, QueryError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.posts
            .lock()
            .map(|posts| posts.clone())
            .map_err(|e| QueryError::FetchError(e.to_string()))
    }

    async fn get(&self, id: u32) -> Result<Post, QueryError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let posts = self
            .posts
            .lock()
            .map_err(|e| QueryError::FetchError(e.to_string()))?;
        posts
            .iter()
            .find(|post| post.id == id)
            .cloned()
            .ok_or_else(|| QueryError::FetchError(format!("post {id} not found")))
    }

    async fn create(&self, title: String) -> Result<Post, QueryError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut posts = self
            .posts
            .lock()
            .map_err(|e| QueryError::MutationError(e.to_string()))?;
        let post = Post {
            id: posts.len() as u32 + 1,
            title,
        };
        posts.push(post.clone());
        Ok(post)
    }
}

#[tokio::main]
async fn main() -> Result<(), QueryError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api = Api::new();
    let client = QueryClient::new();

    let mut list = client.observe(
        query_key!["posts"],
        {
            let api = api.clone();
            move |_ctx: FetchContext| {
                let api = api.clone();
                async move { api.list().await }
            }
        },
        FetchOptions::default(),
    )?;

    // Hovering over a link would prefetch the post it points to.
    client
        .prefetch_query(query_key!["posts", 1], {
            let api = api.clone();
            move |_ctx: FetchContext| {
                let api = api.clone();
                async move { api.get(1).await }
            }
        })
        .await;
    if let Some(post) = client.get_query_data::<Post>(query_key!["posts", 1]) {
        println!("Prefetched: {}", post.title);
    }

    let create_post = Mutation::with_hooks(
        {
            let api = api.clone();
            move |title: String| {
                let api = api.clone();
                async move { api.create(title).await }
            }
        },
        MutationHooks::new()
            .on_success({
                let client = client.clone();
                move |post: &Post, _title: &String, _ctx: Option<&()>| {
                    // The detail page is now served from the cache.
                    if let Err(error) = client.set_query_data(query_key!["posts", post.id], post.clone()) {
                        eprintln!("Could not seed post {}: {error}", post.id);
                    }
                    client.invalidate_queries(QueryFilters::exact(query_key!["posts"]));
                }
            })
            .on_error(|error: &QueryError, title: &String, _ctx: Option<&()>| {
                eprintln!("Creating {title:?} failed: {error}");
            }),
    );

    let mut created = false;
    while let Some(snapshot) = list.changed().await {
        if snapshot.is_loading() {
            println!("Loading...");
            continue;
        }
        if let Some(error) = &snapshot.error {
            println!("Error: {error}");
        }
        let Some(posts) = snapshot.data() else {
            continue;
        };
        if snapshot.is_fetching() {
            continue;
        }
        println!("Posts ({}):", posts.len());
        for post in posts {
            println!("  {} {}", post.id, post.title);
        }

        if created {
            break;
        }
        created = true;
        create_post
            .mutate_async("How to Build Fast Apps with Rust".to_string())
            .await?;
    }

    client.dispose();
    Ok(())
}
