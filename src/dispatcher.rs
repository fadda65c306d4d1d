// ===============================
// src/dispatcher.rs (ReplayDispatcher)
// ===============================
//
// Drives ticks into the StateStore.
// - Replay: ticks dari file di-load ke memori, satu worker memutar dengan
//   jeda tick_interval / speed (speed 0 = tanpa jeda).
// - Live: sumber eksternal push lewat TickPusher -> mpsc -> worker.
// - Ganti session_id = session boundary: settle sesi lama, tutup rekaman,
//   reset state (balance tetap), mulai sesi baru.
// - Playback state lives in a watch channel; every transition is a single
//   check-and-set on it and is announced as PlaybackChanged.
//
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::{RecorderConfig, ReplayConfig};
use crate::domain::{EngineEvent, PlaybackState, RecordingSummary, StateSnapshot, Tick};
use crate::error::{EngineError, EngineResult};
use crate::executor::DecisionExecutor;
use crate::feed::{self, TickPusher};
use crate::metrics::{PLAYBACK_STATE, TICKS_REJECTED};
use crate::recorder::RecordingSink;
use crate::ring::RingBuffer;
use crate::state::StateStore;
use crate::worker::{join_bounded, Lifecycle};

const WORKER: &str = "replay_dispatcher";

/// Result of feeding one tick.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Applied(Arc<StateSnapshot>),
    Rejected,
    /// Nothing left to replay; the session has been closed.
    Finished,
}

struct Cursor {
    ticks: Vec<Tick>,
    next: usize,
    // set by load(); the first tick taken afterwards closes whatever session
    // an interrupted run left open
    reloaded: bool,
}

struct Session {
    session_id: String,
    start_tick: u64,
    ring: RingBuffer<Tick>,
}

struct SessionCtx {
    current: Option<Session>,
    recorder: RecordingSink,
    live: bool,
}

struct Core {
    cfg: ReplayConfig,
    store: Arc<StateStore>,
    bus: Option<Arc<EventBus>>,
    executor: Option<Arc<DecisionExecutor>>,
    ctl_tx: watch::Sender<PlaybackState>,
    cursor: Mutex<Cursor>,
    // held across recorder start/stop, hence the async mutex
    session: AsyncMutex<SessionCtx>,
    speed: Mutex<f64>,
    accepted: AtomicU64,
    lifecycle: Lifecycle,
}

pub struct ReplayDispatcher {
    core: Arc<Core>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayDispatcher {
    pub fn new(
        cfg: ReplayConfig,
        recorder: RecorderConfig,
        store: Arc<StateStore>,
        bus: Option<Arc<EventBus>>,
        executor: Option<Arc<DecisionExecutor>>,
    ) -> Self {
        let (ctl_tx, _) = watch::channel(PlaybackState::Stopped);
        let speed = cfg.speed.max(0.0);
        let core = Core {
            cfg,
            store,
            bus,
            executor,
            ctl_tx,
            cursor: Mutex::new(Cursor { ticks: Vec::new(), next: 0, reloaded: false }),
            session: AsyncMutex::new(SessionCtx { current: None, recorder: RecordingSink::new(recorder), live: false }),
            speed: Mutex::new(speed),
            accepted: AtomicU64::new(0),
            lifecycle: Lifecycle::new(WORKER),
        };
        PLAYBACK_STATE.set(PlaybackState::Stopped.as_gauge());
        Self { core: Arc::new(core), worker: Mutex::new(None) }
    }

    pub fn state(&self) -> PlaybackState { self.core.state() }

    /// Replay cursor as (ticks consumed, ticks loaded).
    pub fn progress(&self) -> (u64, u64) {
        let c = self.core.cursor.lock();
        (c.next as u64, c.ticks.len() as u64)
    }

    /// Ticks committed so far, replay and live together. Never goes backwards.
    pub fn accepted(&self) -> u64 { self.core.accepted.load(Ordering::Relaxed) }

    pub fn speed(&self) -> f64 { *self.core.speed.lock() }

    /// 1.0 = recorded pace, 2.0 = twice as fast, 0.0 = no pacing.
    pub fn set_speed(&self, speed: f64) -> EngineResult<()> {
        if !speed.is_finite() || speed < 0.0 {
            return Err(EngineError::validation("speed", format!("{speed} is not a usable playback speed")));
        }
        *self.core.speed.lock() = speed;
        info!(speed, "playback speed changed");
        Ok(())
    }

    /// Replace the replay sequence. Only while STOPPED. Malformed ticks are
    /// reported as `TickRejected` and left out, so they count neither toward
    /// the position nor the total. Returns how many ticks were kept.
    pub fn load(&self, ticks: Vec<Tick>) -> EngineResult<usize> {
        if self.core.state() != PlaybackState::Stopped {
            return Err(EngineError::AlreadyRunning { worker: WORKER });
        }
        let mut kept = Vec::with_capacity(ticks.len());
        for t in ticks {
            match t.validate() {
                Ok(()) => kept.push(t),
                Err(e) => self.core.reject(&t, &e),
            }
        }
        let n = kept.len();
        *self.core.cursor.lock() = Cursor { ticks: kept, next: 0, reloaded: true };
        info!(ticks = n, "replay sequence loaded");
        Ok(n)
    }

    /// Load a JSONL tick log. Malformed lines are reported as `TickRejected`;
    /// an I/O error is reported as `SourceError` and leaves the dispatcher
    /// STOPPED with its previous sequence.
    pub async fn load_file(&self, path: &Path) -> EngineResult<usize> {
        if self.core.state() != PlaybackState::Stopped {
            return Err(EngineError::AlreadyRunning { worker: WORKER });
        }
        match feed::load_file(path).await {
            Ok(loaded) => {
                for (line, reason) in &loaded.rejected {
                    TICKS_REJECTED.with_label_values(&["malformed"]).inc();
                    self.core.publish(EngineEvent::TickRejected {
                        session_id: None,
                        sequence_number: None,
                        reason: format!("line {line}: {reason}"),
                    });
                }
                self.load(loaded.ticks)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "tick log could not be read");
                self.core.publish(EngineEvent::SourceError { message: format!("{}: {e}", path.display()) });
                Err(e)
            }
        }
    }

    /// STOPPED -> PLAYING (spawns the playback worker), or PAUSED -> PLAYING.
    pub fn play(&self) -> EngineResult<()> {
        if self.core.transition(PlaybackState::Playing, |s| s == PlaybackState::Paused).is_some() {
            return Ok(());
        }
        if self.core.state() != PlaybackState::Stopped {
            return Err(EngineError::AlreadyRunning { worker: WORKER });
        }
        {
            let c = self.core.cursor.lock();
            if c.next >= c.ticks.len() {
                return Err(EngineError::NotReady { what: "replay sequence" });
            }
        }
        self.core.lifecycle.begin_start()?;
        if self.core.transition(PlaybackState::Playing, |s| s == PlaybackState::Stopped).is_none() {
            self.core.lifecycle.mark_stopped();
            return Err(EngineError::AlreadyRunning { worker: WORKER });
        }
        let handle = tokio::spawn(self.core.clone().run_playback());
        *self.worker.lock() = Some(handle);
        self.core.lifecycle.mark_running();
        Ok(())
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.core
            .transition(PlaybackState::Paused, |s| s == PlaybackState::Playing)
            .map(|_| ())
            .ok_or(EngineError::NotReady { what: "playback" })
    }

    pub fn resume(&self) -> EngineResult<()> {
        self.core
            .transition(PlaybackState::Playing, |s| s == PlaybackState::Paused)
            .map(|_| ())
            .ok_or(EngineError::NotReady { what: "paused playback" })
    }

    /// Feed exactly one replay tick from the caller's task. Allowed while
    /// PAUSED or STOPPED.
    pub async fn step(&self) -> EngineResult<StepOutcome> {
        match self.core.state() {
            PlaybackState::Playing | PlaybackState::Live => Err(EngineError::AlreadyRunning { worker: WORKER }),
            _ => Ok(self.core.replay_step().await),
        }
    }

    /// Any state -> STOPPED. The worker is joined within the join timeout
    /// and aborted if it does not exit.
    pub async fn stop(&self) -> EngineResult<()> {
        let from = self.core.transition(PlaybackState::Stopped, |_| true);
        self.core.lifecycle.begin_stop();
        let handle = self.worker.lock().take();
        let res = match handle {
            Some(h) => join_bounded(WORKER, h, Duration::from_millis(self.core.cfg.join_timeout_ms), true).await,
            None => Ok(()),
        };
        self.core.lifecycle.mark_stopped();
        if from.is_some() {
            info!(accepted = self.accepted(), "dispatcher stopped");
        }
        res
    }

    /// STOPPED -> LIVE. Returns the handle live sources push ticks through;
    /// when every pusher is dropped the dispatcher goes back to STOPPED.
    pub async fn attach_live(&self) -> EngineResult<TickPusher> {
        if self.core.state() != PlaybackState::Stopped {
            return Err(EngineError::AlreadyRunning { worker: WORKER });
        }
        self.core.lifecycle.begin_start()?;
        {
            let mut ctx = self.core.session.lock().await;
            // a half-played replay session ends here
            self.core.close_session(&mut ctx).await;
            ctx.live = true;
        }
        if self.core.transition(PlaybackState::Live, |s| s == PlaybackState::Stopped).is_none() {
            self.core.session.lock().await.live = false;
            self.core.lifecycle.mark_stopped();
            return Err(EngineError::AlreadyRunning { worker: WORKER });
        }
        let (tx, rx) = mpsc::channel(self.core.cfg.live_queue_capacity.max(1));
        let handle = tokio::spawn(self.core.clone().run_live(rx));
        *self.worker.lock() = Some(handle);
        self.core.lifecycle.mark_running();
        Ok(TickPusher::new(tx))
    }

    /// LIVE -> STOPPED.
    pub async fn detach(&self) -> EngineResult<()> {
        if self.core.state() != PlaybackState::Live {
            return Ok(());
        }
        self.stop().await
    }

    /// Most recent live ticks of the current session, oldest first.
    pub async fn recent_ticks(&self, n: usize) -> Vec<Tick> {
        let ctx = self.core.session.lock().await;
        ctx.current.as_ref().map(|s| s.ring.tail(n)).unwrap_or_default()
    }

    pub async fn current_session(&self) -> Option<String> {
        let ctx = self.core.session.lock().await;
        ctx.current.as_ref().map(|s| s.session_id.clone())
    }

    /// Close the active recording, if any. Used on shutdown after the
    /// worker has been stopped.
    pub async fn stop_recording(&self) -> Option<RecordingSummary> {
        let mut ctx = self.core.session.lock().await;
        self.core.stop_recording(&mut ctx).await
    }
}

impl Core {
    fn state(&self) -> PlaybackState { *self.ctl_tx.borrow() }

    fn publish(&self, ev: EngineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(ev);
        }
    }

    /// Move to `to` if the current state passes `allowed`. Returns the state
    /// that was left, or `None` when nothing changed.
    fn transition(&self, to: PlaybackState, allowed: impl FnOnce(PlaybackState) -> bool) -> Option<PlaybackState> {
        let mut from = None;
        self.ctl_tx.send_if_modified(|s| {
            if *s == to || !allowed(*s) {
                return false;
            }
            from = Some(*s);
            *s = to;
            true
        });
        if let Some(f) = from {
            PLAYBACK_STATE.set(to.as_gauge());
            info!(from = ?f, to = ?to, "playback state changed");
            self.publish(EngineEvent::PlaybackChanged { from: f, to });
        }
        from
    }

    fn delay(&self) -> Duration {
        let speed = *self.speed.lock();
        if speed <= 0.0 || self.cfg.tick_interval_ms == 0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.cfg.tick_interval_ms as f64 / 1000.0 / speed)
            .unwrap_or(Duration::from_secs(3600))
    }

    fn reject(&self, tick: &Tick, err: &EngineError) {
        TICKS_REJECTED.with_label_values(&[err.label()]).inc();
        warn!(session = %tick.session_id, seq = tick.sequence_number, error = %err, "tick rejected");
        self.publish(EngineEvent::TickRejected {
            session_id: Some(tick.session_id.clone()),
            sequence_number: Some(tick.sequence_number),
            reason: err.to_string(),
        });
    }

    /// (a) take the next tick and its position under the cursor lock,
    /// (b) release, (c) ingest, (d) report progress from what (a) saw.
    async fn replay_step(&self) -> StepOutcome {
        let next = {
            let mut c = self.cursor.lock();
            match c.ticks.get(c.next).cloned() {
                Some(t) => {
                    c.next += 1;
                    let fresh = std::mem::take(&mut c.reloaded);
                    Some((t, fresh, c.next as u64, c.ticks.len() as u64))
                }
                None => None,
            }
        };
        let Some((tick, fresh, position, total)) = next else {
            let mut ctx = self.session.lock().await;
            self.close_session(&mut ctx).await;
            return StepOutcome::Finished;
        };
        let outcome = match self.ingest(tick, fresh).await {
            Some((snap, _)) => StepOutcome::Applied(snap),
            None => StepOutcome::Rejected,
        };
        self.publish(EngineEvent::Progress { position, total: Some(total) });
        outcome
    }

    /// Validate, handle session boundaries, commit, then hand the snapshot
    /// to the executor. Returns the snapshot and the accepted-tick count.
    /// `fresh` marks the first tick of a newly loaded sequence.
    async fn ingest(&self, tick: Tick, fresh: bool) -> Option<(Arc<StateSnapshot>, u64)> {
        if let Err(e) = tick.validate() {
            self.reject(&tick, &e);
            return None;
        }

        let mut ctx = self.session.lock().await;
        if fresh {
            // stop() left the previous run's session open
            self.close_session(&mut ctx).await;
        }
        let boundary = ctx.current.as_ref().map_or(false, |s| s.session_id != tick.session_id);
        if boundary {
            self.close_session(&mut ctx).await;
            self.reset_store();
        }
        if ctx.current.is_none() {
            self.open_session(&mut ctx, &tick).await;
        }

        let snap = match self.store.apply_tick(&tick) {
            Ok(s) => s,
            Err(e) => {
                self.reject(&tick, &e);
                return None;
            }
        };
        let count = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        if ctx.live {
            if let Some(s) = ctx.current.as_mut() {
                s.ring.push(tick.clone());
            }
            ctx.recorder.record(&tick);
        }
        drop(ctx);

        if let Some(ex) = &self.executor {
            ex.enqueue_tick(snap.clone());
            if self.cfg.lockstep && ex.is_running() {
                let wait = Duration::from_millis(self.cfg.lockstep_timeout_ms);
                if let Err(e) = ex.wait_evaluated(snap.version, wait).await {
                    warn!(version = snap.version, error = %e, "lockstep: snapshot not evaluated in time");
                }
            }
        }
        Some((snap, count))
    }

    fn reset_store(&self) {
        if let Err(e) = self.store.reset_session() {
            error!(error = %e, "session reset failed");
        }
    }

    async fn open_session(&self, ctx: &mut SessionCtx, tick: &Tick) {
        // store may still carry a finished session from an earlier run
        let snap = self.store.get_snapshot();
        if let Some(prev) = &snap.session_id {
            let restarted = snap.current_tick.map_or(false, |c| c >= tick.sequence_number);
            if prev != &tick.session_id || restarted {
                self.reset_store();
            }
        }

        info!(session = %tick.session_id, start_tick = tick.sequence_number, "session started");
        ctx.current = Some(Session {
            session_id: tick.session_id.clone(),
            start_tick: tick.sequence_number,
            ring: RingBuffer::new(self.cfg.ring_capacity),
        });
        self.publish(EngineEvent::SessionStarted {
            session_id: tick.session_id.clone(),
            start_tick: tick.sequence_number,
        });
        if ctx.live && ctx.recorder.is_enabled() {
            if let Err(e) = ctx.recorder.start(&tick.session_id).await {
                error!(session = %tick.session_id, error = %e, "recorder: start failed");
            }
        }
    }

    async fn close_session(&self, ctx: &mut SessionCtx) {
        let Some(session) = ctx.current.take() else { return };
        if let Err(e) = self.store.end_session() {
            error!(session = %session.session_id, error = %e, "session settle failed");
        }
        self.stop_recording(ctx).await;
        debug!(
            session = %session.session_id,
            start_tick = session.start_tick,
            buffered = session.ring.len(),
            "session closed"
        );
    }

    async fn stop_recording(&self, ctx: &mut SessionCtx) -> Option<RecordingSummary> {
        let summary = ctx.recorder.stop().await?;
        self.publish(EngineEvent::RecordingStopped { summary: summary.clone() });
        Some(summary)
    }

    async fn run_playback(self: Arc<Self>) {
        let mut ctl = self.ctl_tx.subscribe();
        let idle = Duration::from_millis(self.cfg.join_timeout_ms.clamp(10, 250));
        loop {
            let state = *ctl.borrow_and_update();
            match state {
                PlaybackState::Playing => {}
                PlaybackState::Paused => {
                    let _ = timeout(idle, ctl.changed()).await;
                    continue;
                }
                _ => break,
            }

            if let StepOutcome::Finished = self.replay_step().await {
                info!(accepted = self.accepted.load(Ordering::Relaxed), "replay: end of sequence");
                self.transition(PlaybackState::Stopped, |s| {
                    matches!(s, PlaybackState::Playing | PlaybackState::Paused)
                });
                break;
            }

            let delay = self.delay();
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = ctl.changed() => {}
                }
            }
        }
        self.lifecycle.mark_stopped();
        debug!("replay worker exited");
    }

    async fn run_live(self: Arc<Self>, mut rx: mpsc::Receiver<Tick>) {
        let mut ctl = self.ctl_tx.subscribe();
        loop {
            if *ctl.borrow_and_update() != PlaybackState::Live {
                break;
            }
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(tick) => {
                        if let Some((_, count)) = self.ingest(tick, false).await {
                            self.publish(EngineEvent::Progress { position: count, total: None });
                        }
                    }
                    None => {
                        warn!("live source closed");
                        self.publish(EngineEvent::SourceError { message: "live source closed".into() });
                        break;
                    }
                },
                _ = ctl.changed() => {}
            }
        }

        {
            let mut ctx = self.session.lock().await;
            self.stop_recording(&mut ctx).await;
            ctx.live = false;
        }
        self.transition(PlaybackState::Stopped, |s| s == PlaybackState::Live);
        self.lifecycle.mark_stopped();
        debug!("live worker exited");
    }
}
