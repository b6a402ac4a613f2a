use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::{FutureExt, StreamExt};
use reconq_core::{EventKind, QueueError, QueueItem, Resource, Uid, WatchEventType};
use reconq_store::EntityCache;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::delayed::DelayedDispatch;
use crate::settings::QueueSettings;
use crate::source::WatchStream;

/// Receives events from the consumer task, one invocation at a time.
///
/// A slow handler stalls delivery for the whole resource type; no timeout is applied.
/// Errors and panics are logged and do not stop the queue. Handlers may schedule delayed
/// work through a [`QueueHandle`] but must not await a non-delayed `enqueue` on their own
/// queue: with a full channel that waits on the consumer it is running in.
#[async_trait::async_trait]
pub trait Subscriber<R: Resource>: Send + Sync {
    async fn on_event(&self, kind: EventKind, resource: &R) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<R, F> Subscriber<R> for F
where
    R: Resource,
    F: Fn(EventKind, &R) -> anyhow::Result<()> + Send + Sync,
{
    async fn on_event(&self, kind: EventKind, resource: &R) -> anyhow::Result<()> {
        (self)(kind, resource)
    }
}

type Subscribers<R> = Vec<Arc<dyn Subscriber<R>>>;

struct Shared<R: Resource> {
    kind: String,
    backoff: Backoff,
    // Critical section: cache comparison and every channel write happen under this lock.
    cache: tokio::sync::Mutex<EntityCache<R>>,
    errors: Mutex<FxHashMap<Uid, u32>>,
    delayed: DelayedDispatch,
    tx: RwLock<Option<mpsc::Sender<QueueItem<R>>>>,
    cancel: RwLock<CancellationToken>,
    subscribers: ArcSwap<Subscribers<R>>,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Cloneable producer side of an [`EventQueue`].
pub struct QueueHandle<R: Resource> {
    shared: Arc<Shared<R>>,
}

impl<R: Resource> Clone for QueueHandle<R> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<R: Resource> QueueHandle<R> {
    /// Resource type label used in logs.
    pub fn kind(&self) -> &str { &self.shared.kind }

    /// Feed an observed change into the queue.
    ///
    /// With a non-zero `delay` this only schedules a debounced re-check of the cached
    /// snapshot (see [`QueueHandle::enqueue_delayed`]). Otherwise the resource is compared
    /// against the cache and the resulting event is written, waiting for channel space.
    pub async fn enqueue(&self, resource: R, delay: Option<Duration>) -> Result<(), QueueError> {
        match delay {
            Some(delay) if !delay.is_zero() => {
                self.enqueue_delayed(resource, delay);
                Ok(())
            }
            _ => {
                let mut cache = self.shared.cache.lock().await;
                self.classify_and_write(&mut cache, resource).await
            }
        }
    }

    /// Re-check the cached snapshot of `resource` after `delay`.
    ///
    /// Repeated calls for the same identity collapse into the last one with its full delay.
    /// If the identity has left the cache by then nothing is emitted.
    pub fn enqueue_delayed(&self, resource: R, delay: Duration) {
        let uid = resource.uid().to_owned();
        debug!(
            queue = %self.shared.kind,
            uid = %uid,
            name = %resource.name(),
            delay_ms = delay.as_millis() as u64,
            "enqueued delayed event"
        );
        let weak = Arc::downgrade(&self.shared);
        let fire_uid = uid.clone();
        self.shared.delayed.schedule(&uid, delay, async move {
            if let Some(shared) = weak.upgrade() {
                QueueHandle { shared }.recheck(&fire_uid).await;
            }
        });
    }

    /// Report an actual removal: drop the cache entry, then emit `Deleted`.
    pub async fn enqueue_deleted(&self, resource: R) -> Result<(), QueueError> {
        trace!(queue = %self.shared.kind, uid = %resource.uid(), name = %resource.name(), "resource was deleted");
        let mut cache = self.shared.cache.lock().await;
        cache.remove(&resource);
        metrics::gauge!("queue_cache_entries", cache.len() as f64);
        self.shared.delayed.cancel(resource.uid());
        self.write(EventKind::Deleted, resource).await
    }

    /// Schedule a forced retry of `kind` for `resource` after an exponential backoff.
    ///
    /// The retry bypasses cache comparison. Consecutive calls without [`clear_error`]
    /// grow the delay. Returns the scheduled delay.
    ///
    /// [`clear_error`]: QueueHandle::clear_error
    pub fn enqueue_errored(&self, kind: EventKind, resource: R) -> Duration {
        let uid = resource.uid().to_owned();
        let retry = {
            let mut errors = self.shared.errors.lock().unwrap_or_else(PoisonError::into_inner);
            let count = errors.entry(uid.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let backoff = self.shared.backoff.delay(retry);
        debug!(
            queue = %self.shared.kind,
            uid = %uid,
            name = %resource.name(),
            event = %kind,
            retry,
            backoff_ms = backoff.as_millis() as u64,
            "requeue event with backoff"
        );
        metrics::counter!("queue_retries_total", 1u64, "kind" => kind.as_str());

        let weak = Arc::downgrade(&self.shared);
        self.shared.delayed.schedule(&uid, backoff, async move {
            let Some(shared) = weak.upgrade() else { return };
            let handle = QueueHandle { shared };
            trace!(queue = %handle.shared.kind, uid = %resource.uid(), "backoff requeue timer elapsed");
            let _serialized = handle.shared.cache.lock().await;
            let res = handle.write(kind, resource).await;
            handle.settle(res);
        });
        backoff
    }

    /// Reset the failure count for `resource` after a successful reconciliation.
    pub fn clear_error(&self, resource: &R) {
        self.shared.errors.lock().unwrap_or_else(PoisonError::into_inner).remove(resource.uid());
    }

    pub fn error_count(&self, uid: &str) -> u32 {
        self.shared
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot currently cached for `uid`.
    pub async fn cached(&self, uid: &str) -> Option<R> { self.shared.cache.lock().await.get(uid).cloned() }

    pub fn pending_dispatches(&self) -> usize { self.shared.delayed.len() }

    pub fn has_pending_dispatch(&self, uid: &str) -> bool { self.shared.delayed.contains(uid) }

    /// Append a subscriber; delivery follows registration order.
    pub fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<R> + 'static,
    {
        let subscriber: Arc<dyn Subscriber<R>> = Arc::new(subscriber);
        self.shared.subscribers.rcu(|subs| {
            let mut next = subs.to_vec();
            next.push(Arc::clone(&subscriber));
            next
        });
    }

    async fn recheck(&self, uid: &str) {
        trace!(queue = %self.shared.kind, uid = %uid, "delayed event timer elapsed");
        let mut cache = self.shared.cache.lock().await;
        let Some(cached) = cache.get(uid).cloned() else {
            debug!(queue = %self.shared.kind, uid = %uid, "resource no longer cached; delayed event skipped");
            return;
        };
        let res = self.classify_and_write(&mut cache, cached).await;
        self.settle(res);
    }

    // Caller holds the cache lock.
    async fn classify_and_write(&self, cache: &mut EntityCache<R>, resource: R) -> Result<(), QueueError> {
        if self.shared.delayed.cancel(resource.uid()) {
            debug!(queue = %self.shared.kind, uid = %resource.uid(), "pending delayed event preempted by update");
        }
        let deleting = resource.deletion_timestamp().is_some();
        let (stored, cmp) = cache.upsert(resource);
        metrics::gauge!("queue_cache_entries", cache.len() as f64);
        let kind = EventKind::classify(cmp, deleting);
        trace!(
            queue = %self.shared.kind,
            uid = %stored.uid(),
            name = %stored.name(),
            comparison = ?cmp,
            event = %kind,
            "resource compared against cache"
        );
        self.write(kind, stored).await
    }

    // Caller holds the cache lock so channel order matches decision order.
    async fn write(&self, kind: EventKind, resource: R) -> Result<(), QueueError> {
        trace!(queue = %self.shared.kind, event = %kind, uid = %resource.uid(), "enqueue event");
        let Some(tx) = read(&self.shared.tx) else {
            return Err(self.lost(kind, &resource));
        };
        let token = read(&self.shared.cancel);
        if token.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        // A reserved slot cannot be refused; only a closed channel drops the event.
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(QueueError::Cancelled),
            permit = tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(QueueItem { kind, resource });
                metrics::counter!("queue_events_total", 1u64, "kind" => kind.as_str());
                Ok(())
            }
            Err(_) => Err(self.lost(kind, &resource)),
        }
    }

    fn lost(&self, kind: EventKind, resource: &R) -> QueueError {
        warn!(
            queue = %self.shared.kind,
            event = %kind,
            uid = %resource.uid(),
            name = %resource.name(),
            "queue could not write into output channel; event dropped"
        );
        metrics::counter!("queue_lost_writes_total", 1u64);
        QueueError::Closed
    }

    fn settle(&self, res: Result<(), QueueError>) {
        if let Err(e) = res {
            debug!(queue = %self.shared.kind, error = %e, "event not written");
        }
    }

    async fn dispatch(&self, item: QueueItem<R>) {
        trace!(queue = %self.shared.kind, event = %item.kind, uid = %item.resource.uid(), "read event");
        let started = Instant::now();
        let subscribers = self.shared.subscribers.load_full();
        for sub in subscribers.iter() {
            match AssertUnwindSafe(sub.on_event(item.kind, &item.resource)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(queue = %self.shared.kind, event = %item.kind, uid = %item.resource.uid(), error = %e, "subscriber failed");
                    metrics::counter!("queue_subscriber_failures_total", 1u64);
                }
                Err(_) => {
                    error!(queue = %self.shared.kind, event = %item.kind, uid = %item.resource.uid(), "subscriber panicked");
                    metrics::counter!("queue_subscriber_failures_total", 1u64);
                }
            }
        }
        metrics::histogram!("queue_dispatch_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    fn renew_token(&self) -> CancellationToken {
        let mut token = self.shared.cancel.write().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn cancel(&self) { read(&self.shared.cancel).cancel(); }
}

struct Runtime<R: Resource> {
    rx: Option<mpsc::Receiver<QueueItem<R>>>,
    source: Option<WatchStream<R>>,
    consumer: Option<JoinHandle<mpsc::Receiver<QueueItem<R>>>>,
    watcher: Option<JoinHandle<WatchStream<R>>>,
    disposed: bool,
}

/// Event queue for one resource type.
///
/// Owns the bounded channel, the single consumer task and the optional watch source pump.
/// Producer operations live on [`QueueHandle`]; the delegating methods here are shortcuts.
pub struct EventQueue<R: Resource> {
    handle: QueueHandle<R>,
    runtime: Mutex<Runtime<R>>,
}

impl<R: Resource> EventQueue<R> {
    pub fn new(kind: impl Into<String>, settings: QueueSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let shared = Shared {
            kind: kind.into(),
            backoff: Backoff::from_settings(&settings),
            cache: tokio::sync::Mutex::new(EntityCache::new()),
            errors: Mutex::new(FxHashMap::default()),
            delayed: DelayedDispatch::new(),
            tx: RwLock::new(Some(tx)),
            cancel: RwLock::new(CancellationToken::new()),
            subscribers: ArcSwap::from_pointee(Vec::new()),
        };
        Self {
            handle: QueueHandle { shared: Arc::new(shared) },
            runtime: Mutex::new(Runtime { rx: Some(rx), source: None, consumer: None, watcher: None, disposed: false }),
        }
    }

    /// Queue fed by `source` once started.
    pub fn with_source(kind: impl Into<String>, settings: QueueSettings, source: WatchStream<R>) -> Self {
        let queue = Self::new(kind, settings);
        queue.runtime().source = Some(source);
        queue
    }

    pub fn handle(&self) -> QueueHandle<R> { self.handle.clone() }

    pub fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<R> + 'static,
    {
        self.handle.subscribe(subscriber);
    }

    /// Spawn the consumer task and, if present, the watch source pump.
    ///
    /// Fails with `AlreadyStarted` while running and with `Disposed` after teardown.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut rt = self.runtime();
        if rt.disposed {
            return Err(QueueError::Disposed);
        }
        let Some(rx) = rt.rx.take() else {
            return Err(QueueError::AlreadyStarted);
        };
        info!(queue = %self.handle.kind(), "event queue startup");
        let token = self.handle.renew_token();
        rt.consumer = Some(tokio::spawn(consume(self.handle.clone(), rx, token.clone())));
        if let Some(source) = rt.source.take() {
            rt.watcher = Some(tokio::spawn(pump(self.handle.clone(), source, token)));
        }
        Ok(())
    }

    /// Cancel the consumer, the watch pump and every pending dispatch, then wait for the
    /// tasks to exit. An in-flight subscriber call completes first. Cache, error counts and
    /// the channel are kept, so `start` may resume.
    ///
    /// Must not be awaited from inside a subscriber of this queue.
    pub async fn stop(&self) {
        info!(queue = %self.handle.kind(), "event queue shutdown");
        self.handle.cancel();
        self.handle.shared.delayed.cancel_all();
        let (consumer, watcher) = {
            let mut rt = self.runtime();
            (rt.consumer.take(), rt.watcher.take())
        };
        if let Some(task) = watcher {
            match task.await {
                Ok(source) => self.runtime().source = Some(source),
                Err(e) => error!(queue = %self.handle.kind(), error = %e, "watch task failed"),
            }
        }
        if let Some(task) = consumer {
            match task.await {
                Ok(rx) => self.runtime().rx = Some(rx),
                Err(e) => error!(queue = %self.handle.kind(), error = %e, "queue reader failed"),
            }
        }
    }

    /// Terminal teardown: stop, close the channel, release the watch source, clear the cache
    /// and error counts, and detach all subscribers.
    pub async fn dispose(&self) {
        self.stop().await;
        {
            let mut rt = self.runtime();
            rt.disposed = true;
            rt.rx = None;
            rt.source = None;
        }
        let shared = &self.handle.shared;
        *shared.tx.write().unwrap_or_else(PoisonError::into_inner) = None;
        shared.cache.lock().await.clear();
        shared.errors.lock().unwrap_or_else(PoisonError::into_inner).clear();
        shared.delayed.cancel_all();
        shared.subscribers.store(Arc::new(Vec::new()));
        debug!(queue = %self.handle.kind(), "event queue disposed");
    }

    pub fn is_running(&self) -> bool { self.runtime().consumer.is_some() }

    pub async fn enqueue(&self, resource: R, delay: Option<Duration>) -> Result<(), QueueError> {
        self.handle.enqueue(resource, delay).await
    }

    pub async fn enqueue_deleted(&self, resource: R) -> Result<(), QueueError> {
        self.handle.enqueue_deleted(resource).await
    }

    pub fn enqueue_errored(&self, kind: EventKind, resource: R) -> Duration {
        self.handle.enqueue_errored(kind, resource)
    }

    pub fn clear_error(&self, resource: &R) { self.handle.clear_error(resource) }

    fn runtime(&self) -> MutexGuard<'_, Runtime<R>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Resource> Drop for EventQueue<R> {
    fn drop(&mut self) {
        self.handle.cancel();
        self.handle.shared.delayed.cancel_all();
    }
}

async fn consume<R: Resource>(
    handle: QueueHandle<R>,
    mut rx: mpsc::Receiver<QueueItem<R>>,
    token: CancellationToken,
) -> mpsc::Receiver<QueueItem<R>> {
    trace!(queue = %handle.kind(), "start queue reader");
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some(item) = item else {
            debug!(queue = %handle.kind(), "event channel closed");
            break;
        };
        handle.dispatch(item).await;
    }
    trace!(queue = %handle.kind(), "queue reader stopped");
    rx
}

async fn pump<R: Resource>(handle: QueueHandle<R>, mut source: WatchStream<R>, token: CancellationToken) -> WatchStream<R> {
    info!(queue = %handle.kind(), "watch source started");
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(ev)) => {
                let res = match ev.kind {
                    WatchEventType::Added | WatchEventType::Modified => handle.enqueue(ev.resource, None).await,
                    WatchEventType::Deleted => handle.enqueue_deleted(ev.resource).await,
                };
                handle.settle(res);
            }
            Some(Err(e)) => warn!(queue = %handle.kind(), error = %e, "watch source error"),
            None => {
                warn!(queue = %handle.kind(), "watch source ended");
                break;
            }
        }
    }
    source
}
