// ===============================
// src/executor.rs (DecisionExecutor)
// ===============================
//
// Runs the decision function off the ingestion path.
// - enqueue_tick() overwrites a single-slot mailbox: only the newest snapshot
//   is ever evaluated, stale ones are counted and discarded.
// - The decision function runs on the blocking pool under a timeout; errors,
//   panics and timeouts are logged per tick and treated as NoOp.
// - At most one blocking call is in flight. A call that outlived its timeout
//   keeps the next snapshot waiting in the mailbox until it returns.
// - Heartbeat is refreshed every loop iteration; health_check() compares its
//   age against a threshold.
//
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::ExecutorConfig;
use crate::domain::{Action, Decision, DecisionInput, EngineEvent, StateSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{DECISIONS, DECISION_FAILURES, HEARTBEAT_AGE_MS, MAILBOX_REPLACED};
use crate::state::StateStore;
use crate::strategy::{DecisionError, DecisionFn};
use crate::worker::{join_bounded, Lifecycle};

type SharedDecision = Arc<Mutex<Box<dyn DecisionFn>>>;

struct Shared {
    mailbox: Mutex<Option<Arc<StateSnapshot>>>,
    actions: Mutex<VecDeque<Action>>,
    notify: Notify,
    in_flight: AtomicBool,
    idle: Notify,
    heartbeat_ms: AtomicI64,
    evaluated_tx: watch::Sender<u64>,
    processed: AtomicU64,
    replaced: AtomicU64,
}

pub struct DecisionExecutor {
    cfg: ExecutorConfig,
    store: Arc<StateStore>,
    bus: Option<Arc<EventBus>>,
    decision: SharedDecision,
    name: &'static str,
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DecisionExecutor {
    pub fn new(
        cfg: ExecutorConfig,
        store: Arc<StateStore>,
        bus: Option<Arc<EventBus>>,
        decision: Box<dyn DecisionFn>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let (evaluated_tx, _) = watch::channel(0u64);
        let name = decision.name();
        let shared = Arc::new(Shared {
            mailbox: Mutex::new(None),
            actions: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            in_flight: AtomicBool::new(false),
            idle: Notify::new(),
            heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            evaluated_tx,
            processed: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
        });
        Arc::new(Self {
            cfg,
            store,
            bus,
            decision: Arc::new(Mutex::new(decision)),
            name,
            shared,
            lifecycle: Lifecycle::new("decision_executor"),
            stop_tx,
            worker: Mutex::new(None),
        })
    }

    pub fn start(&self) -> EngineResult<()> {
        self.lifecycle.begin_start()?;
        self.stop_tx.send_replace(false);
        self.shared.heartbeat_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        let worker = Worker {
            cfg: self.cfg.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            decision: self.decision.clone(),
            shared: self.shared.clone(),
        };
        let stop_rx = self.stop_tx.subscribe();
        *self.worker.lock() = Some(tokio::spawn(worker.run(stop_rx)));
        self.lifecycle.mark_running();
        info!(strategy = self.name, "decision executor started");
        Ok(())
    }

    /// Signal the worker and wait for it within the join timeout. A worker
    /// that does not exit in time is aborted and `Timeout` is returned; the
    /// executor is STOPPED either way and can be started again.
    pub async fn stop(&self) -> EngineResult<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        self.stop_tx.send_replace(true);
        self.shared.notify.notify_one();
        let handle = self.worker.lock().take();
        let res = match handle {
            Some(h) => join_bounded("decision_executor", h, Duration::from_millis(self.cfg.join_timeout_ms), true).await,
            None => Ok(()),
        };
        self.lifecycle.mark_stopped();
        info!(processed = self.processed(), replaced = self.replaced(), "decision executor stopped");
        res
    }

    pub fn is_running(&self) -> bool { self.lifecycle.is_running() }

    /// Non-blocking; replaces any snapshot still waiting in the mailbox.
    pub fn enqueue_tick(&self, snapshot: Arc<StateSnapshot>) {
        let stale = self.shared.mailbox.lock().replace(snapshot);
        if let Some(old) = stale {
            self.shared.replaced.fetch_add(1, Ordering::Relaxed);
            MAILBOX_REPLACED.inc();
            debug!(version = old.version, "mailbox: stale snapshot replaced");
        }
        self.shared.notify.notify_one();
    }

    /// Queue an action to be applied by the worker. This is how event
    /// subscribers mutate state without re-entering the store.
    pub fn submit_action(&self, action: Action) {
        self.shared.actions.lock().push_back(action);
        self.shared.notify.notify_one();
    }

    pub fn processed(&self) -> u64 { self.shared.processed.load(Ordering::Relaxed) }
    pub fn replaced(&self) -> u64 { self.shared.replaced.load(Ordering::Relaxed) }

    pub fn heartbeat_age_ms(&self) -> u64 {
        let age = Utc::now().timestamp_millis() - self.shared.heartbeat_ms.load(Ordering::SeqCst);
        age.max(0) as u64
    }

    /// `WorkerUnresponsive` when the heartbeat is older than the configured
    /// threshold.
    pub fn health_check(&self) -> EngineResult<()> {
        if !self.is_running() {
            return Err(EngineError::NotReady { what: "decision executor" });
        }
        let age = self.heartbeat_age_ms();
        HEARTBEAT_AGE_MS.set(age as i64);
        if age > self.cfg.heartbeat_stale_ms {
            return Err(EngineError::WorkerUnresponsive { worker: "decision_executor", stale_ms: age });
        }
        Ok(())
    }

    /// Wait until the snapshot with `version` (or a later one) has been
    /// evaluated.
    pub async fn wait_evaluated(&self, version: u64, wait: Duration) -> EngineResult<()> {
        let mut rx = self.shared.evaluated_tx.subscribe();
        let res = match timeout(wait, rx.wait_for(|v| *v >= version)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(EngineError::NotReady { what: "decision executor" }),
            Err(_) => Err(EngineError::Timeout { what: "decision evaluation", waited_ms: wait.as_millis() as u64 }),
        };
        res
    }
}

/// Clears `in_flight` when the blocking call returns or unwinds.
struct InFlight(Arc<Shared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
        self.0.idle.notify_one();
    }
}

struct Worker {
    cfg: ExecutorConfig,
    store: Arc<StateStore>,
    bus: Option<Arc<EventBus>>,
    decision: SharedDecision,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.cfg.poll_interval_ms.max(1));
        loop {
            self.shared.heartbeat_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            if *stop_rx.borrow() {
                break;
            }

            let action = self.shared.actions.lock().pop_front();
            if let Some(a) = action {
                self.apply(0, a, "submitted action".to_string());
                continue;
            }

            // previous call timed out but still owns the decision function
            if self.shared.in_flight.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = self.shared.idle.notified() => {}
                    res = stop_rx.changed() => {
                        if res.is_err() { break; }
                    }
                    _ = sleep(poll) => {}
                }
                continue;
            }

            let next = self.shared.mailbox.lock().take();
            if let Some(snap) = next {
                self.evaluate(snap).await;
                continue;
            }

            tokio::select! {
                _ = self.shared.notify.notified() => {}
                res = stop_rx.changed() => {
                    if res.is_err() { break; }
                }
                _ = sleep(poll) => {}
            }
        }
        debug!("decision worker exited");
    }

    async fn evaluate(&self, snap: Arc<StateSnapshot>) {
        let version = snap.version;
        let input = DecisionInput::from_snapshot(snap);
        let decision = self.decision.clone();
        let wait = Duration::from_millis(self.cfg.decision_timeout_ms);
        self.shared.in_flight.store(true, Ordering::SeqCst);
        let busy = InFlight(self.shared.clone());
        let task = tokio::task::spawn_blocking(move || {
            let _busy = busy;
            decision.lock().decide(&input)
        });

        match timeout(wait, task).await {
            Ok(Ok(Ok(Decision { action, rationale }))) => self.apply(version, action, rationale),
            Ok(Ok(Err(DecisionError::Warmup(why)))) => {
                debug!(version, why, "decision skipped");
            }
            Ok(Ok(Err(e))) => self.fail(version, "error", e.to_string()),
            Ok(Err(join)) => self.fail(version, "panic", format!("decision function panicked: {join}")),
            Err(_) => self.fail(version, "timeout", format!("no decision within {}ms", wait.as_millis())),
        }
        self.shared.processed.fetch_add(1, Ordering::Relaxed);
        self.shared.evaluated_tx.send_replace(version);
    }

    fn apply(&self, version: u64, action: Action, rationale: String) {
        DECISIONS.with_label_values(&[action.label()]).inc();
        let (applied, error) = match self.store.apply_action(&action) {
            Ok(_) => (action != Action::NoOp, None),
            Err(e) => {
                warn!(version, action = action.label(), error = %e, "decision rejected by state store");
                (false, Some(e.to_string()))
            }
        };
        if let Some(bus) = &self.bus {
            bus.publish(EngineEvent::DecisionMade { version, action, rationale, applied, error });
        }
    }

    fn fail(&self, version: u64, kind: &'static str, reason: String) {
        DECISION_FAILURES.with_label_values(&[kind]).inc();
        warn!(version, kind, %reason, "decision failed, treated as noop");
        if let Some(bus) = &self.bus {
            bus.publish(EngineEvent::DecisionFailed { version, reason });
        }
    }
}
