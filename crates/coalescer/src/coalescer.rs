use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::CoalescerConfig;
use crate::error::{CoalesceError, panic_message};
use crate::key::{InvocationKey, KeyDeriver, KeyGenerator};

/// The settled outcome of a call, as delivered to every waiter.
type Outcome<T, E> = Result<T, CoalesceError<E>>;

type BoxedFn<A, T, E> = dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync;

type Predicate<A> = dyn Fn(&A) -> bool + Send + Sync;

type Waiters<T, E> = Arc<Mutex<Vec<oneshot::Sender<Outcome<T, E>>>>>;

/// A successful result saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct CompletedEntry<T> {
    value: T,
    /// When the result was produced.
    produced_at: Instant,
    /// When to evict this entry from the in-memory cache, `None` if never.
    deadline: Option<std::time::Instant>,
}

type CompletedCache<T> = moka::sync::Cache<String, CompletedEntry<T>>;

/// A struct implementing [`moka::Expiry`] that uses the [`CompletedEntry`] deadline as the
/// explicit expiration time.
///
/// This only evicts. Whether an entry may be reused is decided against `produced_at`, which
/// follows the tokio clock.
struct CompletedExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(
    current_time: std::time::Instant,
    target_time: std::time::Instant,
) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl<T> moka::Expiry<String, CompletedEntry<T>> for CompletedExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CompletedEntry<T>,
        current_time: std::time::Instant,
    ) -> Option<Duration> {
        let deadline = value.deadline?;
        saturating_duration_since(current_time, deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CompletedEntry<T>,
        current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        let deadline = value.deadline?;
        saturating_duration_since(current_time, deadline)
    }
}

/// Bookkeeping for an execution that is currently in flight.
struct Pending<T, E> {
    /// Distinguishes this registration from later ones for the same key.
    id: u64,
    /// Callers waiting for the outcome, in attachment order.
    waiters: Waiters<T, E>,
}

/// An execution of the wrapped function for one registration.
///
/// Dropping an execution that has not settled, because its task was dropped or settling
/// panicked, abandons it: the registration is retired and all waiters receive
/// [`CoalesceError::Abandoned`].
struct Execution<A, T, E> {
    inner: Arc<Inner<A, T, E>>,
    key: String,
    id: u64,
    started: Instant,
    waiters: Waiters<T, E>,
    settled: bool,
}

impl<A, T, E> Drop for Execution<A, T, E> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.abandon(&self.key, self.id, &self.waiters);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner<A, T, E> {
    name: String,
    cache_duration: Duration,
    keys: KeyDeriver<A>,
    should_cache: Option<Box<Predicate<A>>>,
    func: Box<BoxedFn<A, T, E>>,

    /// Executions currently in flight, by key.
    pending: Mutex<HashMap<String, Pending<T, E>>>,
    /// Successful results, by key.
    completed: CompletedCache<T>,
    next_id: AtomicU64,
}

/// Wraps a function so that concurrent calls with the same arguments share one execution.
///
/// Calls are identified by a key derived from their arguments, see [`key`](crate::key) for how
/// keys are derived. The first call for a key spawns the wrapped function onto the tokio runtime.
/// Calls with the same key that arrive before it settles wait for that execution and receive a
/// clone of its outcome. A successful result is then reused for the configured cache duration.
/// Errors are never reused, and neither are panics, which are caught and reported as
/// [`CoalesceError::Panicked`].
///
/// Cloning a `Coalescer` is cheap, and the clones share all state. Coalescers that were built
/// separately never share state.
pub struct Coalescer<A, T, E> {
    inner: Arc<Inner<A, T, E>>,
}

impl<A, T, E> Clone for Coalescer<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> std::fmt::Debug for Coalescer<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .inner
            .pending
            .try_lock()
            .map(|pending| pending.len())
            .unwrap_or_default();
        f.debug_struct("Coalescer")
            .field("name", &self.inner.name)
            .field("cache_duration", &self.inner.cache_duration)
            .field("in-memory items", &self.inner.completed.entry_count())
            .field("pending executions", &pending)
            .finish()
    }
}

impl<A, T, E> Coalescer<A, T, E>
where
    A: Serialize + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    /// Wraps an async function with the default configuration.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        CoalescerBuilder::new().build(f)
    }

    /// Wraps a synchronous function with the default configuration.
    pub fn new_sync<F>(f: F) -> Self
    where
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
    {
        CoalescerBuilder::new().build_sync(f)
    }

    /// Calls the wrapped function, or joins an execution that is already in flight.
    ///
    /// The call is registered before this method returns, so concurrent callers see it
    /// even if the returned future is never polled. This method never panics, and the
    /// wrapped function's errors surface only through the returned future.
    pub fn call(&self, args: A) -> CallFuture<T, E> {
        let name = self.inner.name.as_str();

        if !self.inner.should_cache(&args) {
            metric!(counter("coalescer.bypass") += 1, "coalescer" => name);
            return CallFuture::direct(self.inner.invoke(args));
        }

        metric!(counter("coalescer.access") += 1, "coalescer" => name);
        let InvocationKey { key, fallback } = self.inner.keys.derive(&args);
        if fallback {
            metric!(counter("coalescer.key_fallback") += 1, "coalescer" => name);
        }

        if let Some(value) = self.inner.fresh_value(&key) {
            metric!(counter("coalescer.memory.hit") += 1, "coalescer" => name);
            return CallFuture::ready(Ok(value));
        }

        let (sender, receiver) = oneshot::channel();
        let mut pending = lock(&self.inner.pending);

        if let Some(registration) = pending.get(&key) {
            lock(&registration.waiters).push(sender);
            metric!(counter("coalescer.coalesced") += 1, "coalescer" => name);
            tracing::trace!(coalescer = name, key, "Joining in-flight execution");
            return CallFuture::waiting(receiver, None);
        }

        // The execution may have settled between the first lookup and taking the lock.
        if let Some(value) = self.inner.fresh_value(&key) {
            metric!(counter("coalescer.memory.hit") += 1, "coalescer" => name);
            return CallFuture::ready(Ok(value));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let waiters: Waiters<T, E> = Arc::new(Mutex::new(vec![sender]));
        pending.insert(
            key.clone(),
            Pending {
                id,
                waiters: Arc::clone(&waiters),
            },
        );
        metric!(gauge("coalescer.pending") = pending.len() as u64, "coalescer" => name);
        drop(pending);

        metric!(counter("coalescer.computation") += 1, "coalescer" => name);
        let driver = self.spawn_execution(key, id, waiters, args);
        CallFuture::waiting(receiver, driver)
    }

    /// Drops all in-flight registrations and all cached results.
    ///
    /// Executions that are still running settle their current waiters, but their results
    /// are not cached.
    pub fn clear_cache(&self) {
        let mut pending = lock(&self.inner.pending);
        pending.clear();
        self.inner.completed.invalidate_all();
        tracing::debug!(coalescer = self.inner.name, "Cleared all cached results");
    }

    /// Drops the in-flight registration and the cached result for the key of `args`.
    ///
    /// Calls whose key could not be derived are never cached, so there is nothing to clear
    /// for them.
    pub fn clear_key(&self, args: &A) {
        let InvocationKey { key, fallback } = self.inner.keys.derive(args);
        if fallback {
            return;
        }

        let mut pending = lock(&self.inner.pending);
        pending.remove(&key);
        self.inner.completed.invalidate(&key);
        tracing::debug!(coalescer = self.inner.name, key, "Cleared cached result");
    }

    /// Returns the key that a call with `args` would use.
    pub fn derive_key(&self, args: &A) -> String {
        self.inner.keys.derive(args).key
    }

    /// Returns the number of executions currently in flight.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Returns the number of cached results that are still fresh.
    pub fn cached_count(&self) -> usize {
        self.inner
            .completed
            .iter()
            // iteration can still yield entries that were just invalidated
            .filter(|(key, entry)| {
                self.inner.is_fresh(entry) && self.inner.completed.contains_key(key.as_str())
            })
            .count()
    }

    /// Starts executing the wrapped function for a new registration.
    ///
    /// The execution is spawned onto the current tokio runtime. Outside of a runtime there is
    /// nothing to spawn onto, and the execution is returned so that the caller drives it instead.
    /// If that caller drops its future early, the execution is abandoned.
    fn spawn_execution(
        &self,
        key: String,
        id: u64,
        waiters: Waiters<T, E>,
        args: A,
    ) -> Option<BoxFuture<'static, ()>> {
        let mut execution = Execution {
            inner: Arc::clone(&self.inner),
            key,
            id,
            started: Instant::now(),
            waiters,
            settled: false,
        };
        let task = async move {
            let outcome = execution.inner.invoke(args).await;
            let Execution {
                inner,
                key,
                id,
                started,
                waiters,
                ..
            } = &execution;
            inner.settle(key, *id, *started, waiters, outcome);
            execution.settled = true;
        };
        // Bind a fresh hub, the caller's scope may be popped before the execution finishes.
        let task = task.bind_hub(Hub::new_from_top(Hub::current()));

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(task);
                None
            }
            Err(_) => {
                tracing::debug!(
                    coalescer = self.inner.name,
                    "No tokio runtime available, the first caller drives the execution"
                );
                Some(task.boxed())
            }
        }
    }
}

impl<A, T, E> Inner<A, T, E>
where
    A: Serialize + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    /// Evaluates the caching predicate, treating a panic as "cacheable".
    fn should_cache(&self, args: &A) -> bool {
        let Some(predicate) = &self.should_cache else {
            return true;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| predicate(args))) {
            Ok(should_cache) => should_cache,
            Err(payload) => {
                tracing::warn!(
                    coalescer = self.name,
                    panic = panic_message(&*payload),
                    "Caching predicate panicked, caching the call anyway"
                );
                true
            }
        }
    }

    fn is_fresh(&self, entry: &CompletedEntry<T>) -> bool {
        entry.produced_at.elapsed() < self.cache_duration
    }

    fn fresh_value(&self, key: &str) -> Option<T> {
        let entry = self.completed.get(key)?;
        self.is_fresh(&entry).then_some(entry.value)
    }

    /// Invokes the wrapped function, turning panics into errors.
    fn invoke(&self, args: A) -> BoxFuture<'static, Outcome<T, E>> {
        let name = self.name.clone();
        let future = match panic::catch_unwind(AssertUnwindSafe(|| (self.func)(args))) {
            Ok(future) => future,
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::error!(coalescer = name, panic = message, "Wrapped function panicked");
                return future::ready(Err(CoalesceError::Panicked(message))).boxed();
            }
        };

        AssertUnwindSafe(future)
            .catch_unwind()
            .map(move |result| match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(CoalesceError::Failed(err)),
                Err(payload) => {
                    let message = panic_message(&*payload);
                    tracing::error!(coalescer = name, panic = message, "Wrapped function panicked");
                    Err(CoalesceError::Panicked(message))
                }
            })
            .boxed()
    }

    /// Caches a successful outcome, retires the registration and notifies all waiters.
    fn settle(
        &self,
        key: &str,
        id: u64,
        started: Instant,
        waiters: &Waiters<T, E>,
        outcome: Outcome<T, E>,
    ) {
        let name = self.name.as_str();
        metric!(
            timer("coalescer.computation.duration") = started.elapsed(),
            "coalescer" => name,
            "status" => if outcome.is_ok() { "success" } else { "failure" },
        );

        {
            let mut pending = lock(&self.pending);
            let is_current = pending.get(key).is_some_and(|pending| pending.id == id);
            if is_current {
                if let Ok(value) = &outcome {
                    let produced_at = Instant::now();
                    let entry = CompletedEntry {
                        value: value.clone(),
                        produced_at,
                        deadline: produced_at.into_std().checked_add(self.cache_duration),
                    };
                    self.completed.insert(key.to_owned(), entry);
                }
                pending.remove(key);
                metric!(gauge("coalescer.pending") = pending.len() as u64, "coalescer" => name);
            } else {
                tracing::debug!(
                    coalescer = name,
                    key,
                    "Registration was cleared while in flight, not caching the result"
                );
            }
        }

        // No new waiters can attach once the registration is gone.
        let waiters = std::mem::take(&mut *lock(waiters));
        for (position, waiter) in waiters.into_iter().enumerate() {
            if waiter.send(outcome.clone()).is_err() {
                metric!(counter("coalescer.waiter.dropped") += 1, "coalescer" => name);
                tracing::debug!(
                    coalescer = name,
                    key,
                    position,
                    "Caller went away before the outcome was delivered"
                );
            }
        }
    }
}

impl<A, T, E> Inner<A, T, E> {
    /// Retires a registration whose execution will never settle and fails its waiters.
    fn abandon(&self, key: &str, id: u64, waiters: &Waiters<T, E>) {
        let name = self.name.as_str();
        {
            let mut pending = lock(&self.pending);
            if pending.get(key).is_some_and(|pending| pending.id == id) {
                pending.remove(key);
                metric!(gauge("coalescer.pending") = pending.len() as u64, "coalescer" => name);
            }
        }

        metric!(counter("coalescer.abandoned") += 1, "coalescer" => name);
        tracing::warn!(coalescer = name, key, "Execution was dropped before it settled");

        let waiters = std::mem::take(&mut *lock(waiters));
        for waiter in waiters {
            // receivers that are gone need no answer
            let _ = waiter.send(Err(CoalesceError::Abandoned));
        }
    }
}

/// Configures and builds a [`Coalescer`].
///
/// The argument type `A` is usually inferred from the function passed to
/// [`build`](Self::build) or [`build_sync`](Self::build_sync).
pub struct CoalescerBuilder<A> {
    config: CoalescerConfig,
    key_generator: Option<Box<KeyGenerator<A>>>,
    should_cache: Option<Box<Predicate<A>>>,
}

impl<A> Default for CoalescerBuilder<A> {
    fn default() -> Self {
        Self {
            config: CoalescerConfig::default(),
            key_generator: None,
            should_cache: None,
        }
    }
}

impl<A> CoalescerBuilder<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all data settings with `config`.
    pub fn config(mut self, config: CoalescerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// How long a successful result is reused. Defaults to 300ms.
    pub fn cache_duration(mut self, cache_duration: Duration) -> Self {
        self.config.cache_duration = cache_duration;
        self
    }

    /// Derives keys only from the arguments at these positions.
    pub fn key_fields(mut self, key_fields: impl IntoIterator<Item = usize>) -> Self {
        self.config.key_fields = Some(key_fields.into_iter().collect());
        self
    }

    pub fn max_key_depth(mut self, max_key_depth: usize) -> Self {
        self.config.max_key_depth = max_key_depth;
        self
    }

    pub fn max_capacity(mut self, max_capacity: u64) -> Self {
        self.config.max_capacity = max_capacity;
        self
    }

    /// Derives keys with a custom function instead of serializing the arguments.
    ///
    /// If the function returns an error or panics, the call gets a unique key and is never
    /// coalesced.
    pub fn key_generator<G>(mut self, key_generator: G) -> Self
    where
        G: Fn(&A) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.key_generator = Some(Box::new(key_generator));
        self
    }

    /// Decides per call whether it is coalesced and cached at all.
    ///
    /// Calls for which this returns `false` invoke the function directly. If it panics, the
    /// call is coalesced and cached as usual.
    pub fn should_cache<P>(mut self, should_cache: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.should_cache = Some(Box::new(should_cache));
        self
    }

    /// Wraps an async function.
    pub fn build<F, Fut, T, E>(self, f: F) -> Coalescer<A, T, E>
    where
        A: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + 'static,
    {
        self.finish(Box::new(move |args| f(args).boxed()))
    }

    /// Wraps a synchronous function.
    ///
    /// The function runs on the runtime's worker threads, it should not block for long.
    pub fn build_sync<F, T, E>(self, f: F) -> Coalescer<A, T, E>
    where
        A: Serialize + Send + 'static,
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + 'static,
    {
        self.finish(Box::new(move |args| future::ready(f(args)).boxed()))
    }

    fn finish<T, E>(self, func: Box<BoxedFn<A, T, E>>) -> Coalescer<A, T, E>
    where
        T: Clone + Send + Sync + 'static,
    {
        let Self {
            config,
            key_generator,
            should_cache,
        } = self;

        let completed = CompletedCache::builder()
            .max_capacity(config.max_capacity)
            .name(&config.name)
            .expire_after(CompletedExpiration)
            .build();

        Coalescer {
            inner: Arc::new(Inner {
                name: config.name,
                cache_duration: config.cache_duration,
                keys: KeyDeriver {
                    generator: key_generator,
                    key_fields: config.key_fields,
                    max_depth: config.max_key_depth,
                },
                should_cache,
                func,
                pending: Default::default(),
                completed,
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

/// The future returned by [`Coalescer::call`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct CallFuture<T, E> {
    /// The execution itself, only when it could not be spawned onto a runtime.
    driver: Option<BoxFuture<'static, ()>>,
    state: CallState<T, E>,
}

enum CallState<T, E> {
    /// Served from the cache.
    Ready(Option<Outcome<T, E>>),
    /// Waiting for a shared execution.
    Waiting(oneshot::Receiver<Outcome<T, E>>),
    /// An execution that bypasses coalescing.
    Direct(BoxFuture<'static, Outcome<T, E>>),
}

impl<T, E> CallFuture<T, E> {
    fn ready(outcome: Outcome<T, E>) -> Self {
        Self {
            driver: None,
            state: CallState::Ready(Some(outcome)),
        }
    }

    fn waiting(
        receiver: oneshot::Receiver<Outcome<T, E>>,
        driver: Option<BoxFuture<'static, ()>>,
    ) -> Self {
        Self {
            driver,
            state: CallState::Waiting(receiver),
        }
    }

    fn direct(future: BoxFuture<'static, Outcome<T, E>>) -> Self {
        Self {
            driver: None,
            state: CallState::Direct(future),
        }
    }
}

// `T` and `E` are only ever moved out of the future, never pinned.
impl<T, E> Unpin for CallFuture<T, E> {}

impl<T, E> Future for CallFuture<T, E> {
    type Output = Outcome<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(driver) = this.driver.as_mut() {
            if driver.as_mut().poll(cx).is_ready() {
                this.driver = None;
            }
        }

        match &mut this.state {
            CallState::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(CoalesceError::Abandoned)))
            }
            CallState::Waiting(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CoalesceError::Abandoned))),
            CallState::Direct(future) => future.as_mut().poll(cx),
        }
    }
}
