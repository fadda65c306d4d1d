// ===============================
// src/main.rs
// ===============================
/*
 # replay satu file secepatnya, strategi mean reversion, deterministik
 cargo run --release -- --replay ticks.jsonl --speed 0 --lockstep --strategy mean-reversion

 # live mock feed + rekam tiap session ke ./recordings
 cargo run --release -- --live mock --record-dir recordings

 # status playback & saldo
 curl -s localhost:9898/metrics | egrep '^(playback_state|balance_milli|ticks_applied_total)'
*/
/*
=============================================================================
Project : replay_bot_rust — tick replay / live ingestion engine in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Replays recorded session ticks or ingests a live push feed into a
          simulated trading state, runs a pluggable decision function off the
          ingestion path, publishes every mutation on an async event bus,
          records live sessions to JSONL and exposes Prometheus metrics.
=============================================================================
*/
use std::sync::Arc;

use tokio::{
    select,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use replay_bot::bus::EventBus;
use replay_bot::config::{self, LiveMode, StrategyMode};
use replay_bot::dispatcher::ReplayDispatcher;
use replay_bot::domain::{EngineEvent, PlaybackState};
use replay_bot::executor::DecisionExecutor;
use replay_bot::feed::{self, MockFeedConfig};
use replay_bot::metrics;
use replay_bot::state::StateStore;
use replay_bot::strategy::{DecisionFn, MeanReversion, Passive};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let (args, cfg) = config::load();

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        replay = ?args.replay,
        live = ?args.live,
        strategy = args.strategy.label(),
        speed = cfg.replay.speed,
        lockstep = cfg.replay.lockstep,
        record_dir = ?args.record_dir,
        initial_balance = %cfg.store.initial_balance,
        "startup config"
    );

    // ---- Engine ----
    let bus = EventBus::new(cfg.bus.clone());
    let (_ui_sub, mut ui_rx) = bus.subscribe_channel("ui", 4096);
    let store = Arc::new(StateStore::new(cfg.store.clone(), Some(bus.clone())));

    let decision: Box<dyn DecisionFn> = match args.strategy {
        StrategyMode::Passive => Box::new(Passive),
        StrategyMode::MeanReversion => Box::new(MeanReversion::default()),
    };
    let executor = DecisionExecutor::new(cfg.executor.clone(), store.clone(), Some(bus.clone()), decision);
    let dispatcher = Arc::new(ReplayDispatcher::new(
        cfg.replay.clone(),
        cfg.recorder.clone(),
        store.clone(),
        Some(bus.clone()),
        Some(executor.clone()),
    ));

    if let Err(e) = bus.start() {
        error!(error = %e, "event bus failed to start");
        return;
    }
    if let Err(e) = executor.start() {
        error!(error = %e, "decision executor failed to start");
        let _ = bus.stop().await;
        return;
    }

    // ---- Source ----
    let mut source_task: Option<JoinHandle<()>> = None;
    match (&args.replay, &args.live) {
        (Some(path), _) => match dispatcher.load_file(path).await {
            Ok(n) => {
                info!(path = %path.display(), ticks = n, "replay loaded");
                if let Err(e) = dispatcher.play() {
                    warn!(error = %e, "replay did not start");
                }
            }
            Err(e) => error!(path = %path.display(), error = %e, "replay file unusable"),
        },
        (None, Some(mode)) => match dispatcher.attach_live().await {
            Ok(pusher) => {
                source_task = Some(match mode {
                    LiveMode::Mock => tokio::spawn(feed::run_mock(pusher, MockFeedConfig::default())),
                    LiveMode::Ws => tokio::spawn(feed::run_ws(pusher, args.ws_url.clone())),
                });
            }
            Err(e) => error!(error = %e, "live source could not be attached"),
        },
        (None, None) => warn!("nothing to ingest: pass --replay <file> or --live mock|ws"),
    }

    // ---- Coordination loop: log events + heartbeat ----
    let mut heartbeat = interval(Duration::from_secs(1));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut events: u64 = 0;

    loop {
        select! {
            Some(ev) = ui_rx.recv() => {
                events += 1;
                log_event(&ev);
            },
            _ = heartbeat.tick() => {
                if let Err(e) = executor.health_check() {
                    warn!(error = %e, "decision executor unhealthy");
                }
                let snap = store.get_snapshot();
                let state = dispatcher.state();
                info!(
                    events,
                    state = ?state,
                    session = ?snap.session_id,
                    tick = ?snap.current_tick,
                    balance = %snap.balance,
                    position = snap.position.is_some(),
                    "heartbeat"
                );
                events = 0;
                if state == PlaybackState::Stopped {
                    info!("ingestion finished");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("ctrl-c received, shutting down");
                break;
            }
        }
    }

    // ---- Shutdown: dispatcher -> executor -> recorder -> bus ----
    if let Err(e) = dispatcher.stop().await {
        warn!(error = %e, "dispatcher stop");
    }
    if let Some(t) = source_task {
        t.abort();
    }
    if let Err(e) = executor.stop().await {
        warn!(error = %e, "executor stop");
    }
    if let Some(summary) = dispatcher.stop_recording().await {
        info!(session = %summary.session_id, ticks = summary.tick_count, path = %summary.path, "recording closed");
    }
    if let Err(e) = bus.stop().await {
        warn!(error = %e, "event bus stop");
    }
    while let Ok(ev) = ui_rx.try_recv() {
        log_event(&ev);
    }

    let snap = store.get_snapshot();
    info!(balance = %snap.balance, version = snap.version, "bye");
}

fn log_event(ev: &EngineEvent) {
    match ev {
        EngineEvent::TickApplied { tick, .. } => {
            debug!(session = %tick.session_id, seq = tick.sequence_number, price = %tick.price, "tick")
        }
        EngineEvent::Progress { position, total } => debug!(position, total = ?total, "progress"),
        EngineEvent::TickRejected { reason, .. } => warn!(%reason, "tick rejected"),
        EngineEvent::SourceError { message } => warn!(%message, "source error"),
        EngineEvent::DecisionFailed { version, reason } => warn!(version, %reason, "decision failed"),
        EngineEvent::DecisionMade { action, rationale, applied, error, .. } => {
            if *applied {
                info!(action = action.label(), %rationale, "decision applied");
            } else {
                debug!(action = action.label(), error = ?error, "decision not applied");
            }
        }
        other => match serde_json::to_string(other) {
            Ok(js) => info!(kind = other.kind(), payload = %js, "event"),
            Err(_) => info!(kind = other.kind(), "event"),
        },
    }
}
