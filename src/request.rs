//! Deduplication, queueing and throttling of outgoing requests.
//!
//! Requests sharing a key while one is in flight are answered by the
//! in-flight request. At most `max_concurrent` requests run at once, the rest
//! wait in FIFO order (priority requests jump the line), and consecutive
//! request starts are spaced by at least `min_interval` across every caller
//! of the same manager.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub max_concurrent: usize,
    pub min_interval: Duration,
    pub cache_ttl: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            min_interval: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the manager's dedup window for this request.
    pub cache_ttl: Option<Duration>,
    pub skip_cache: bool,
    pub priority: bool,
}

impl RequestOptions {
    pub fn fresh() -> Self {
        Self {
            skip_cache: true,
            ..Self::default()
        }
    }

    pub fn priority() -> Self {
        Self {
            priority: true,
            ..Self::default()
        }
    }
}

type SharedRequest<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct PendingEntry<T, E> {
    id: u64,
    request: SharedRequest<T, E>,
    created: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct Slots {
    active: usize,
    queue: VecDeque<oneshot::Sender<()>>,
}

struct Inner<T, E> {
    config: RequestConfig,
    pending: Mutex<HashMap<String, PendingEntry<T, E>>>,
    slots: Mutex<Slots>,
    last_start: tokio::sync::Mutex<Option<Instant>>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T, E> Inner<T, E> {
    async fn acquire(&self, priority: bool) {
        let waiter = {
            let mut slots = lock(&self.slots);
            if slots.active < self.config.max_concurrent && slots.queue.is_empty() {
                slots.active += 1;
                return;
            }

            let (tx, rx) = oneshot::channel();
            if priority {
                slots.queue.push_front(tx);
            } else {
                slots.queue.push_back(tx);
            }
            rx
        };

        // The releasing side counts the slot as ours before signalling.
        let _ = waiter.await;
    }

    fn release(&self) {
        let mut slots = lock(&self.slots);
        slots.active = slots.active.saturating_sub(1);

        while slots.active < self.config.max_concurrent {
            match slots.queue.pop_front() {
                Some(next) => {
                    if next.send(()).is_ok() {
                        slots.active += 1;
                    }
                }
                None => break,
            }
        }
    }

    async fn throttle(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(prev) = *last {
            let next = prev + self.config.min_interval;
            if next > Instant::now() {
                sleep_until(next).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn forget(&self, key: &str, id: u64) {
        let mut pending = lock(&self.pending);
        if pending.get(key).map(|e| e.id) == Some(id) {
            pending.remove(key);
        }
    }
}

/// Releases the slot and the dedup entry however the request ends.
struct Completion<T, E> {
    inner: Arc<Inner<T, E>>,
    key: String,
    id: u64,
}

impl<T, E> Drop for Completion<T, E> {
    fn drop(&mut self) {
        self.inner.forget(&self.key, self.id);
        self.inner.release();
    }
}

pub type BoxRequest<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;

pub struct BatchRequest<T, E> {
    pub key: String,
    pub request: BoxRequest<T, E>,
    pub transform: Option<Box<dyn FnOnce(T) -> T + Send>>,
}

impl<T, E> BatchRequest<T, E> {
    pub fn new<F, Fut>(key: impl Into<String>, request: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            key: key.into(),
            request: Box::new(move || request().boxed()),
            transform: None,
        }
    }

    pub fn map(mut self, transform: impl FnOnce(T) -> T + Send + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }
}

pub struct RequestManager<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for RequestManager<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for RequestManager<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(RequestConfig::default())
    }
}

impl<T, E> RequestManager<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(config: RequestConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RequestConfig {
                    max_concurrent: config.max_concurrent.max(1),
                    ..config
                },
                pending: Mutex::new(HashMap::new()),
                slots: Mutex::new(Slots::default()),
                last_start: tokio::sync::Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RequestConfig {
        &self.inner.config
    }

    /// Runs `request` under `key`, or joins the request already in flight
    /// for that key. Errors are handed back unchanged; nothing is retried.
    pub async fn execute<F, Fut>(&self, key: &str, request: F, opts: RequestOptions) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = {
            let mut pending = lock(&self.inner.pending);

            let joined = pending
                .get(key)
                .filter(|entry| !opts.skip_cache && entry.created.elapsed() < entry.ttl)
                .map(|entry| entry.request.clone());

            match joined {
                Some(existing) => {
                    debug!(key, "joining in-flight request");
                    existing
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let shared = self.spawn(key, id, request, opts.priority);
                    pending.insert(
                        key.to_string(),
                        PendingEntry {
                            id,
                            request: shared.clone(),
                            created: Instant::now(),
                            ttl: opts.cache_ttl.unwrap_or(self.inner.config.cache_ttl),
                        },
                    );
                    shared
                }
            }
        };

        shared.await
    }

    fn spawn<F, Fut>(&self, key: &str, id: u64, request: F, priority: bool) -> SharedRequest<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();

        let handle = tokio::spawn(async move {
            inner.acquire(priority).await;
            let _done = Completion {
                inner: Arc::clone(&inner),
                key,
                id,
            };
            inner.throttle().await;
            request().await
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            }
        }
        .boxed()
        .shared()
    }

    /// Runs every request and returns the results in order. The first
    /// failure is returned as soon as it happens.
    pub async fn batch(&self, requests: Vec<BatchRequest<T, E>>) -> Result<Vec<T>, E> {
        try_join_all(requests.into_iter().map(|r| async move {
            let value = self
                .execute(&r.key, r.request, RequestOptions::default())
                .await?;
            Ok(match r.transform {
                Some(transform) => transform(value),
                None => value,
            })
        }))
        .await
    }

    /// Stops deduplicating `key`, or every key. In-flight requests still run
    /// to completion.
    pub fn clear_cache(&self, key: Option<&str>) {
        let mut pending = lock(&self.inner.pending);
        match key {
            Some(key) => {
                pending.remove(key);
            }
            None => pending.clear(),
        }
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn active_requests(&self) -> usize {
        lock(&self.inner.slots).active
    }

    pub fn queued_requests(&self) -> usize {
        lock(&self.inner.slots).queue.len()
    }
}
