//! Delayed dispatch: at most one pending timer per identity, newest registration wins.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use reconq_core::Uid;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

struct Pending {
    id: u64,
    fire_at: Instant,
    cancel: CancellationToken,
}

type PendingMap = Arc<Mutex<FxHashMap<Uid, Pending>>>;

fn lock(map: &PendingMap) -> MutexGuard<'_, FxHashMap<Uid, Pending>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of debounced re-checks and backoff retries keyed by resource identity.
#[derive(Default)]
pub struct DelayedDispatch {
    pending: PendingMap,
    next_id: AtomicU64,
}

impl DelayedDispatch {
    pub fn new() -> Self { Self::default() }

    /// Run `on_fire` after `delay` unless superseded or canceled first.
    ///
    /// An existing entry for `uid` is canceled and replaced, restarting the full delay. The
    /// entry is removed before `on_fire` runs, so the callback may schedule again for the
    /// same identity. Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, uid: &str, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let fire_at = Instant::now() + delay;
        {
            let mut pending = lock(&self.pending);
            let prev = pending.insert(uid.to_owned(), Pending { id, fire_at, cancel: cancel.clone() });
            if let Some(prev) = prev {
                prev.cancel.cancel();
                debug!(uid = %uid, "superseded pending dispatch");
            }
            metrics::gauge!("queue_pending_dispatches", pending.len() as f64);
        }

        let registry = Arc::clone(&self.pending);
        let uid = uid.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(fire_at) => {}
            }
            {
                let mut pending = lock(&registry);
                match pending.get(&uid) {
                    Some(p) if p.id == id => {
                        pending.remove(&uid);
                    }
                    // replaced between wake-up and lock
                    _ => return,
                }
                metrics::gauge!("queue_pending_dispatches", pending.len() as f64);
            }
            if AssertUnwindSafe(on_fire).catch_unwind().await.is_err() {
                error!(uid = %uid, "delayed dispatch callback panicked");
            }
        });
    }

    /// Cancel the pending entry for `uid`. Returns whether one existed.
    pub fn cancel(&self, uid: &str) -> bool {
        let mut pending = lock(&self.pending);
        match pending.remove(uid) {
            Some(p) => {
                p.cancel.cancel();
                metrics::gauge!("queue_pending_dispatches", pending.len() as f64);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let mut pending = lock(&self.pending);
        let n = pending.len();
        for (_, p) in pending.drain() {
            p.cancel.cancel();
        }
        metrics::gauge!("queue_pending_dispatches", 0.0);
        if n > 0 {
            debug!(count = n, "canceled all pending dispatches");
        }
    }

    pub fn contains(&self, uid: &str) -> bool { lock(&self.pending).contains_key(uid) }

    /// Deadline of the pending entry for `uid`, if any.
    pub fn fire_at(&self, uid: &str) -> Option<Instant> { lock(&self.pending).get(uid).map(|p| p.fire_at) }

    pub fn len(&self) -> usize { lock(&self.pending).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl Drop for DelayedDispatch {
    fn drop(&mut self) { self.cancel_all(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> { Arc::new(AtomicUsize::new(0)) }

    fn bump(c: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let c = Arc::clone(c);
        async move {
            c.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let reg = DelayedDispatch::new();
        let hits = counter();
        reg.schedule("a", Duration::from_secs(5), bump(&hits));
        assert!(reg.contains("a"));

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_restarts_delay_and_keeps_only_latest() {
        let reg = DelayedDispatch::new();
        let first = counter();
        let second = counter();
        reg.schedule("a", Duration::from_secs(5), bump(&first));
        let first_deadline = reg.fire_at("a").unwrap();
        assert_eq!(first_deadline, Instant::now() + Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(3)).await;
        reg.schedule("a", Duration::from_secs(5), bump(&second));
        assert_eq!(reg.len(), 1);
        let second_deadline = reg.fire_at("a").unwrap();
        assert_eq!(second_deadline, Instant::now() + Duration::from_secs(5));
        assert!(second_deadline - first_deadline >= Duration::from_secs(3));

        // the first deadline passes without anything firing
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_cancel_all_prevent_fire() {
        let reg = DelayedDispatch::new();
        let hits = counter();
        reg.schedule("a", Duration::from_secs(1), bump(&hits));
        reg.schedule("b", Duration::from_secs(1), bump(&hits));
        reg.schedule("c", Duration::from_secs(1), bump(&hits));

        assert!(reg.fire_at("a").is_some());
        assert!(reg.fire_at("missing").is_none());
        assert!(reg.cancel("a"));
        assert!(!reg.cancel("a"));
        assert!(reg.fire_at("a").is_none());
        reg.cancel_all();
        assert!(reg.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_gone_when_callback_runs() {
        let reg = Arc::new(DelayedDispatch::new());
        let seen = Arc::new(Mutex::new(None));
        let (r, s) = (Arc::clone(&reg), Arc::clone(&seen));
        reg.schedule("a", Duration::from_secs(1), async move {
            *s.lock().unwrap() = Some(r.contains("a"));
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*seen.lock().unwrap(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_leaves_registry_usable() {
        let reg = DelayedDispatch::new();
        reg.schedule("a", Duration::from_secs(1), async {
            panic!("boom");
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(reg.is_empty());

        let hits = counter();
        reg.schedule("a", Duration::from_secs(1), bump(&hits));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
