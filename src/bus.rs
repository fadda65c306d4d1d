// ===============================
// src/bus.rs
// ===============================
//
// Bounded async pub/sub:
// - publish() never blocks the producer; on overflow the oldest event is dropped.
// - One dispatch task delivers to subscribers in registration order.
// - A panicking subscriber is logged and skipped; the others still get the event.
// - Shutdown goes through a dedicated watch signal, never a sentinel in the queue.
//
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::domain::EngineEvent;
use crate::error::EngineResult;
use crate::metrics::{EVENTS_DROPPED, EVENTS_PUBLISHED, SUBSCRIBER_FAILURES};
use crate::worker::{join_bounded, Lifecycle};

pub type Callback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is running a bus subscriber callback.
pub fn in_callback() -> bool {
    IN_CALLBACK.with(|c| c.get())
}

struct Subscriber {
    id: SubscriptionId,
    name: String,
    cb: Callback,
}

struct Shared {
    capacity: usize,
    queue: Mutex<VecDeque<EngineEvent>>,
    subscribers: Mutex<Vec<Subscriber>>,
    notify: Notify,
    next_id: AtomicU64,
    busy: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl Shared {
    fn pop(&self) -> Option<EngineEvent> {
        let mut q = self.queue.lock();
        let ev = q.pop_front();
        if ev.is_some() {
            self.busy.store(true, Ordering::SeqCst);
        }
        ev
    }

    fn deliver(&self, ev: &EngineEvent) {
        // copy list under lock, release, then invoke
        let subs: Vec<(String, Callback)> = self
            .subscribers
            .lock()
            .iter()
            .map(|s| (s.name.clone(), s.cb.clone()))
            .collect();

        for (name, cb) in subs {
            IN_CALLBACK.with(|c| c.set(true));
            let res = catch_unwind(AssertUnwindSafe(|| cb(ev)));
            IN_CALLBACK.with(|c| c.set(false));
            if res.is_err() {
                SUBSCRIBER_FAILURES.inc();
                error!(subscriber = %name, kind = ev.kind(), "subscriber panicked, skipped");
            }
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.busy.store(false, Ordering::SeqCst);
    }
}

pub struct EventBus {
    cfg: BusConfig,
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(cfg: BusConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            capacity: cfg.capacity.max(1),
            queue: Mutex::new(VecDeque::with_capacity(cfg.capacity.min(1024))),
            subscribers: Mutex::new(Vec::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            busy: AtomicBool::new(false),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });
        Arc::new(Self { cfg, shared, lifecycle: Lifecycle::new("event_bus"), stop_tx, worker: Mutex::new(None) })
    }

    /// Spawn the dispatch task. Must be called inside a tokio runtime.
    pub fn start(&self) -> EngineResult<()> {
        self.lifecycle.begin_start()?;
        self.stop_tx.send_replace(false);
        let shared = self.shared.clone();
        let cfg = self.cfg.clone();
        let stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(dispatch_loop(shared, cfg, stop_rx));
        *self.worker.lock() = Some(handle);
        self.lifecycle.mark_running();
        info!(capacity = self.cfg.capacity, "event bus started");
        Ok(())
    }

    /// Signal the dispatch task, let it drain best-effort, and wait for it to
    /// exit. If it is still alive after the join timeout it is aborted and
    /// `Timeout` is returned.
    pub async fn stop(&self) -> EngineResult<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        self.stop_tx.send_replace(true);
        self.shared.notify.notify_one();
        let handle = self.worker.lock().take();
        let res = match handle {
            Some(h) => join_bounded("event_bus", h, Duration::from_millis(self.cfg.join_timeout_ms), true).await,
            None => Ok(()),
        };
        self.lifecycle.mark_stopped();
        info!(
            published = self.published(),
            delivered = self.delivered(),
            dropped = self.dropped(),
            "event bus stopped"
        );
        res
    }

    pub fn is_running(&self) -> bool { self.lifecycle.is_running() }

    /// Enqueue and return immediately. When the queue is full the oldest
    /// pending event is evicted.
    pub fn publish(&self, ev: EngineEvent) {
        let evicted = {
            let mut q = self.shared.queue.lock();
            let evicted = if q.len() >= self.shared.capacity { q.pop_front() } else { None };
            q.push_back(ev);
            evicted
        };
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        EVENTS_PUBLISHED.inc();
        if let Some(old) = evicted {
            let n = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            EVENTS_DROPPED.inc();
            if n == 1 || n % 1_000 == 0 {
                warn!(dropped_total = n, kind = old.kind(), "event queue full, dropped oldest");
            }
        }
        self.shared.notify.notify_one();
    }

    /// Register a callback. Registering the same `Arc` twice returns the
    /// existing id.
    pub fn subscribe(&self, name: impl Into<String>, cb: Callback) -> SubscriptionId {
        let mut subs = self.shared.subscribers.lock();
        let ptr = Arc::as_ptr(&cb) as *const ();
        if let Some(s) = subs.iter().find(|s| Arc::as_ptr(&s.cb) as *const () == ptr) {
            return s.id;
        }
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        debug!(subscriber = %name, id = id.0, "subscribed");
        subs.push(Subscriber { id, name, cb });
        id
    }

    /// Forward every event into a bounded channel. A full channel drops the
    /// event for this subscriber only.
    pub fn subscribe_channel(&self, name: impl Into<String>, capacity: usize) -> (SubscriptionId, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let name = name.into();
        let label = name.clone();
        let cb: Callback = Arc::new(move |ev: &EngineEvent| {
            if tx.try_send(ev.clone()).is_err() {
                debug!(subscriber = %label, kind = ev.kind(), "channel subscriber full/closed");
            }
        });
        (self.subscribe(name, cb), rx)
    }

    /// Returns false when the id was not (or no longer) registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.shared.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    pub fn subscriber_count(&self) -> usize { self.shared.subscribers.lock().len() }
    pub fn pending(&self) -> usize { self.shared.queue.lock().len() }
    pub fn published(&self) -> u64 { self.shared.published.load(Ordering::Relaxed) }
    pub fn dropped(&self) -> u64 { self.shared.dropped.load(Ordering::Relaxed) }
    pub fn delivered(&self) -> u64 { self.shared.delivered.load(Ordering::Relaxed) }

    /// Wait until everything queued so far has been delivered.
    pub async fn flush(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            {
                let q = self.shared.queue.lock();
                if q.is_empty() && !self.shared.busy.load(Ordering::SeqCst) {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(2)).await;
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, cfg: BusConfig, mut stop_rx: watch::Receiver<bool>) {
    let poll = Duration::from_millis(cfg.poll_interval_ms.max(1));
    'outer: loop {
        while let Some(ev) = shared.pop() {
            shared.deliver(&ev);
            if *stop_rx.borrow() {
                break 'outer;
            }
        }
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = shared.notify.notified() => {}
            res = stop_rx.changed() => {
                if res.is_err() { break; }
            }
            _ = sleep(poll) => {}
        }
    }

    // best-effort drain, bounded by drain_timeout
    let deadline = Instant::now() + Duration::from_millis(cfg.drain_timeout_ms);
    let mut drained = 0u64;
    while Instant::now() < deadline {
        match shared.pop() {
            Some(ev) => {
                shared.deliver(&ev);
                drained += 1;
            }
            None => break,
        }
    }
    let left = shared.queue.lock().len();
    if left > 0 {
        warn!(left, drained, "event bus stopped with undelivered events");
    } else {
        debug!(drained, "event bus drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(i: u64) -> EngineEvent {
        EngineEvent::Progress { position: i, total: None }
    }

    fn small_cfg(capacity: usize) -> BusConfig {
        BusConfig { capacity, poll_interval_ms: 5, drain_timeout_ms: 200, join_timeout_ms: 1_000 }
    }

    #[tokio::test]
    async fn delivers_in_registration_order() {
        let bus = EventBus::new(small_cfg(16));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let seen = seen.clone();
            bus.subscribe(name, Arc::new(move |_ev: &EngineEvent| seen.lock().push(name)));
        }
        bus.start().unwrap();
        bus.publish(progress(1));
        assert!(bus.flush(Duration::from_secs(1)).await);
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_stays_bounded() {
        let bus = EventBus::new(small_cfg(4));
        // not started: nothing drains
        for i in 0..10 {
            bus.publish(progress(i));
        }
        assert_eq!(bus.pending(), 4);
        assert_eq!(bus.dropped(), 6);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s2 = seen.clone();
        bus.subscribe("rec", Arc::new(move |ev: &EngineEvent| {
            if let EngineEvent::Progress { position, .. } = ev {
                s2.lock().push(*position);
            }
        }));
        bus.start().unwrap();
        assert!(bus.flush(Duration::from_secs(1)).await);
        assert_eq!(*seen.lock(), vec![6, 7, 8, 9]);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_subscriber_is_isolated() {
        let bus = EventBus::new(small_cfg(16));
        let hits = Arc::new(AtomicU64::new(0));
        bus.subscribe("bad", Arc::new(|_ev: &EngineEvent| panic!("boom")));
        let h = hits.clone();
        bus.subscribe("good", Arc::new(move |_ev: &EngineEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        bus.start().unwrap();
        bus.publish(progress(1));
        bus.publish(progress(2));
        assert!(bus.flush(Duration::from_secs(1)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_are_idempotent() {
        let bus = EventBus::new(small_cfg(16));
        let cb: Callback = Arc::new(|_ev: &EngineEvent| {});
        let a = bus.subscribe("x", cb.clone());
        let b = bus.subscribe("x", cb);
        assert_eq!(a, b);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn callback_flag_is_set_only_inside_callbacks() {
        let bus = EventBus::new(small_cfg(16));
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        bus.subscribe("flag-check", Arc::new(move |_ev: &EngineEvent| f.store(in_callback(), Ordering::SeqCst)));
        bus.start().unwrap();
        bus.publish(progress(1));
        assert!(bus.flush(Duration::from_secs(1)).await);
        assert!(flag.load(Ordering::SeqCst));
        assert!(!in_callback());
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let bus = EventBus::new(small_cfg(16));
        bus.start().unwrap();
        assert!(bus.start().is_err());
        bus.stop().await.unwrap();
        bus.start().unwrap();
        bus.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_with_full_queue_returns_within_timeout() {
        let bus = EventBus::new(BusConfig { capacity: 64, poll_interval_ms: 5, drain_timeout_ms: 50, join_timeout_ms: 500 });
        bus.subscribe("slow", Arc::new(|_ev: &EngineEvent| std::thread::sleep(std::time::Duration::from_millis(5))));
        bus.start().unwrap();
        for i in 0..1_000 {
            bus.publish(progress(i));
        }
        let t0 = Instant::now();
        let _ = bus.stop().await;
        assert!(t0.elapsed() < Duration::from_millis(900));
        assert!(!bus.is_running());
    }
}
