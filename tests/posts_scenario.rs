// End-to-end tests: a posts list kept in sync with mutations

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use qcache::prelude::*;
use qcache::query_key;
use tokio::time::{Duration, sleep, timeout};

#[derive(Debug, Clone, PartialEq)]
struct Post {
    id: u32,
    title: String,
}

/// In-memory backend standing in for an HTTP API.
#[derive(Clone, Default)]
struct Backend {
    posts: Arc<Mutex<Vec<Post>>>,
    list_calls: Arc<AtomicUsize>,
}

impl Backend {
    fn with_posts(titles: &[&str]) -> Self {
        let backend = Self::default();
        for title in titles {
            backend.insert(title);
        }
        backend
    }

    fn insert(&self, title: &str) -> Post {
        let mut posts = self.posts.lock().unwrap();
        let post = Post {
            id: posts.len() as u32 + 1,
            title: title.to_string(),
        };
        posts.push(post.clone());
        post
    }

    fn list_fetcher(
        &self,
    ) -> impl Fn(FetchContext) -> futures::future::BoxFuture<'static, Result<Vec<Post>, QueryError>>
    + Send
    + Sync
    + 'static {
        use futures::FutureExt;

        let backend = self.clone();
        move |_ctx| {
            backend.list_calls.fetch_add(1, Ordering::SeqCst);
            let posts = backend.posts.lock().unwrap().clone();
            async move {
                sleep(Duration::from_millis(20)).await;
                Ok(posts)
            }
            .boxed()
        }
    }
}

fn create_post_mutation(backend: &Backend, client: &QueryClient) -> Mutation<String, Post> {
    let backend = backend.clone();
    let client = client.clone();
    Mutation::with_hooks(
        move |title: String| {
            let post = backend.insert(&title);
            async move { Ok(post) }
        },
        MutationHooks::new().on_success(move |post: &Post, _title: &String, _ctx: Option<&()>| {
            // Seed the detail view, then refresh the list.
            client
                .set_query_data(query_key!["posts", post.id], post.clone())
                .expect("post key is valid");
            client.invalidate_queries(QueryFilters::exact(query_key!["posts"]));
        }),
    )
}

async fn next_matching(
    observer: &mut QueryObserver<Vec<Post>>,
    predicate: impl Fn(&QuerySnapshot<Vec<Post>>) -> bool,
) -> QuerySnapshot<Vec<Post>> {
    timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = observer.snapshot();
            if predicate(&snapshot) {
                return snapshot;
            }
            observer.changed().await.expect("posts entry should stay cached");
        }
    })
    .await
    .expect("observer should see the expected state")
}

#[tokio::test(start_paused = true)]
async fn test_mutation_refreshes_observed_list() {
    let backend = Backend::with_posts(&["A"]);
    let client = QueryClient::new();

    let mut list = client
        .observe(query_key!["posts"], backend.list_fetcher(), FetchOptions::default())
        .unwrap();
    let mut other_list = client
        .observe(query_key!["posts"], backend.list_fetcher(), FetchOptions::default())
        .unwrap();

    let loaded = next_matching(&mut list, QuerySnapshot::is_success).await;
    assert_eq!(loaded.data().map(Vec::len), Some(1));
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);

    let create_post = create_post_mutation(&backend, &client);
    let created = create_post.mutate_async("B".to_string()).await.unwrap();
    assert_eq!(created.id, 2);

    let refreshed = next_matching(&mut list, |s| s.data().map(Vec::len) == Some(2)).await;
    let titles: Vec<_> = refreshed
        .data()
        .unwrap()
        .iter()
        .map(|p| p.title.as_str())
        .collect();
    assert_eq!(titles, vec!["A", "B"]);

    let other = next_matching(&mut other_list, |s| s.data().map(Vec::len) == Some(2)).await;
    assert!(Arc::ptr_eq(
        refreshed.data.as_ref().unwrap(),
        other.data.as_ref().unwrap()
    ));
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);

    // The detail entry was seeded by the success hook.
    let detail = client.get_query_data::<Post>(query_key!["posts", 2]).unwrap();
    assert_eq!(detail.title, "B");
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_list_refetches_on_next_read() {
    let backend = Backend::with_posts(&["A"]);
    let client = QueryClient::new();

    let posts = client
        .fetch_query(query_key!["posts"], backend.list_fetcher())
        .await
        .unwrap();
    assert_eq!(posts.len(), 1);

    create_post_mutation(&backend, &client)
        .run("B".to_string())
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        backend.list_calls.load(Ordering::SeqCst),
        1,
        "nobody observes the list, so invalidation only marks it stale"
    );

    let posts = client
        .fetch_query(query_key!["posts"], backend.list_fetcher())
        .await
        .unwrap();
    assert_eq!(posts.len(), 2);
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_mutation_leaves_cache_untouched() {
    let backend = Backend::with_posts(&["A"]);
    let client = QueryClient::new();
    client
        .fetch_query(query_key!["posts"], backend.list_fetcher())
        .await
        .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let create_post = Mutation::with_hooks(
        |_title: String| async { Err::<Post, _>(QueryError::MutationError("503".to_string())) },
        MutationHooks::new()
            .on_success({
                let client = client.clone();
                move |_post: &Post, _title: &String, _ctx: Option<&()>| {
                    client.invalidate_queries(QueryFilters::exact(query_key!["posts"]));
                }
            })
            .on_error({
                let errors = errors.clone();
                move |_error, _title, _ctx| {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );

    let result = create_post.mutate_async("B".to_string()).await;
    assert_eq!(result, Err(QueryError::MutationError("503".to_string())));
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    let state = client
        .get_query_state::<Vec<Post>>(query_key!["posts"])
        .unwrap();
    assert!(!state.is_stale);
    assert_eq!(state.data().map(Vec::len), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_update_rolls_back_with_context() {
    let client = QueryClient::new();
    client
        .set_query_data(
            query_key!["posts"],
            vec![Post {
                id: 1,
                title: "A".to_string(),
            }],
        )
        .unwrap();

    let hooks = MutationHooks::new()
        .on_mutate({
            let client = client.clone();
            move |title: &String| {
                let previous = client
                    .get_query_data::<Vec<Post>>(query_key!["posts"])
                    .unwrap_or_default();
                let mut next = (*previous).clone();
                next.push(Post {
                    id: 0,
                    title: title.clone(),
                });
                client
                    .set_query_data(query_key!["posts"], next)
                    .expect("posts key is valid");
                previous
            }
        })
        .on_error({
            let client = client.clone();
            move |_error: &QueryError, _title: &String, previous: Option<&Arc<Vec<Post>>>| {
                if let Some(previous) = previous {
                    client
                        .set_query_data(query_key!["posts"], (**previous).clone())
                        .expect("posts key is valid");
                }
            }
        });
    let create_post = Mutation::with_hooks(
        {
            let client = client.clone();
            move |_title: String| {
                let optimistic = client
                    .get_query_data::<Vec<Post>>(query_key!["posts"])
                    .map_or(0, |posts| posts.len());
                async move {
                    assert_eq!(optimistic, 2, "optimistic post is visible while pending");
                    Err::<Post, _>(QueryError::MutationError("rejected".to_string()))
                }
            }
        },
        hooks,
    );

    assert!(create_post.run("B".to_string()).await.is_err());
    let posts = client
        .get_query_data::<Vec<Post>>(query_key!["posts"])
        .unwrap();
    assert_eq!(posts.len(), 1);
}
