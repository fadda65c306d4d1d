//! End-to-end flows across store, bus, executor and dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::{sleep, Duration};

use replay_bot::bus::EventBus;
use replay_bot::config::{BusConfig, ExecutorConfig, RecorderConfig, ReplayConfig, StoreConfig};
use replay_bot::dispatcher::ReplayDispatcher;
use replay_bot::domain::{Action, Decision, DecisionInput, EngineEvent, Phase, PlaybackState, StateSnapshot, Tick};
use replay_bot::error::EngineError;
use replay_bot::executor::DecisionExecutor;
use replay_bot::state::StateStore;
use replay_bot::strategy::{DecisionError, MeanReversion};

fn tick(session: &str, seq: u64, price: Decimal) -> Tick {
    Tick { session_id: session.into(), sequence_number: seq, price, phase: Phase::Active, is_terminal: false, timestamp: 0 }
}

fn fast_executor() -> ExecutorConfig {
    ExecutorConfig { poll_interval_ms: 5, ..Default::default() }
}

async fn wait_stopped(d: &ReplayDispatcher) {
    for _ in 0..1_000 {
        if d.state() == PlaybackState::Stopped {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("dispatcher still {:?}", d.state());
}

#[tokio::test]
async fn open_then_close_publishes_four_events_in_order() {
    let bus = EventBus::new(BusConfig::default());
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    bus.subscribe("kinds", Arc::new(move |ev: &EngineEvent| sink.lock().push(ev.kind())));
    bus.start().unwrap();

    let store = StateStore::new(StoreConfig::default(), Some(bus.clone()));
    let start = store.get_snapshot().balance;
    store.apply_tick(&tick("g1", 1, dec!(1.0))).unwrap();
    store.open_position(dec!(0.01)).unwrap();
    store.apply_tick(&tick("g1", 2, dec!(2.0))).unwrap();
    let snap = store.close_position().unwrap();

    assert_eq!(snap.balance, start + dec!(0.01));
    assert!(snap.position.is_none());
    assert!(bus.flush(Duration::from_secs(1)).await);
    assert_eq!(*kinds.lock(), vec!["TickApplied", "PositionOpened", "TickApplied", "PositionClosed"]);
    bus.stop().await.unwrap();
}

fn wave_session() -> Vec<Tick> {
    let shape = [dec!(1.0), dec!(1.1), dec!(1.2), dec!(1.1), dec!(1.0), dec!(0.9), dec!(0.8), dec!(0.9)];
    let mut ticks: Vec<Tick> = (0..64u64).map(|i| tick("det-1", i + 1, shape[(i % 8) as usize])).collect();
    ticks.push(Tick {
        session_id: "det-1".into(),
        sequence_number: 65,
        price: Decimal::ZERO,
        phase: Phase::Rugged,
        is_terminal: true,
        timestamp: 0,
    });
    ticks
}

async fn lockstep_run(ticks: Vec<Tick>) -> (Vec<EngineEvent>, StateSnapshot) {
    let bus = EventBus::new(BusConfig::default());
    let (_, mut rx) = bus.subscribe_channel("record", 8_192);
    let store = Arc::new(StateStore::new(StoreConfig::default(), Some(bus.clone())));
    let strategy = MeanReversion::new(4, dec!(0.05), dec!(0.01));
    let executor = DecisionExecutor::new(fast_executor(), store.clone(), Some(bus.clone()), Box::new(strategy));
    let cfg = ReplayConfig { speed: 0.0, lockstep: true, ..Default::default() };
    let d = ReplayDispatcher::new(cfg, RecorderConfig::default(), store.clone(), Some(bus.clone()), Some(executor.clone()));

    bus.start().unwrap();
    executor.start().unwrap();
    d.load(ticks).unwrap();
    d.play().unwrap();
    wait_stopped(&d).await;
    d.stop().await.unwrap();
    executor.stop().await.unwrap();
    assert!(bus.flush(Duration::from_secs(2)).await);
    bus.stop().await.unwrap();

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    let snap = (*store.get_snapshot()).clone();
    (events, snap)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lockstep_replay_is_deterministic() {
    let (first_events, first_snap) = lockstep_run(wave_session()).await;
    let (second_events, second_snap) = lockstep_run(wave_session()).await;

    assert!(first_events.iter().any(|e| matches!(e, EngineEvent::PositionOpened { .. })));
    assert!(first_events.iter().any(|e| matches!(e, EngineEvent::SessionEnded { .. })));
    assert_eq!(first_events.len(), second_events.len());
    assert_eq!(first_events, second_events);
    assert_eq!(first_snap, second_snap);
}

#[test]
fn concurrent_readers_never_see_a_half_applied_mutation() {
    let store = Arc::new(StateStore::new(StoreConfig::default(), None));
    let start = store.get_snapshot().balance;
    // at price 1 every open/close moves value between balance and stake 1:1
    store.apply_tick(&tick("g1", 1, dec!(1))).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut reads = 0u64;
                let mut last_version = 0;
                while !done.load(Ordering::Relaxed) {
                    let s = store.get_snapshot();
                    let staked = s.position.as_ref().map(|p| p.amount).unwrap_or_default();
                    assert_eq!(s.balance + staked, start, "torn snapshot at v{}", s.version);
                    assert!(s.version >= last_version);
                    last_version = s.version;
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for _ in 0..300 {
        store.open_position(dec!(0.01)).unwrap();
        store.partial_close(dec!(0.5)).unwrap();
        store.close_position().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    for r in readers {
        assert!(r.join().unwrap() > 0);
    }
    assert_eq!(store.get_snapshot().balance, start);
}

#[tokio::test]
async fn new_session_settles_the_old_one_and_keeps_balance() {
    let bus = EventBus::new(BusConfig::default());
    let (_, mut rx) = bus.subscribe_channel("record", 1_024);
    bus.start().unwrap();
    let store = Arc::new(StateStore::new(StoreConfig::default(), Some(bus.clone())));
    let d = ReplayDispatcher::new(
        ReplayConfig { speed: 0.0, ..Default::default() },
        RecorderConfig::default(),
        store.clone(),
        Some(bus.clone()),
        None,
    );
    d.load(vec![tick("a", 1, dec!(1)), tick("a", 2, dec!(1)), tick("b", 1, dec!(1)), tick("b", 2, dec!(1))]).unwrap();

    d.step().await.unwrap();
    store.place_side_bet(dec!(0.02)).unwrap();
    d.step().await.unwrap();
    d.step().await.unwrap();

    let snap = store.get_snapshot();
    assert_eq!(snap.session_id.as_deref(), Some("b"));
    assert!(snap.side_bet.is_none());
    assert_eq!(snap.balance, dec!(0.08));

    assert!(bus.flush(Duration::from_secs(1)).await);
    let mut kinds = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.push(ev.kind());
    }
    let pos = |k: &str| kinds.iter().position(|x| *x == k).unwrap();
    assert!(pos("SideBetResolved") < pos("SessionEnded"));
    assert!(pos("SessionEnded") < pos("StateReset"));
    assert_eq!(kinds.iter().filter(|k| **k == "SessionStarted").count(), 2);
    bus.stop().await.unwrap();
}

fn assert_invariants(s: &StateSnapshot) {
    assert!(s.balance >= Decimal::ZERO, "negative balance at v{}", s.version);
    assert!(s.price >= Decimal::ZERO);
    if let Some(p) = &s.position {
        assert!(p.amount > Decimal::ZERO && p.amount <= p.entry_amount);
        assert!(p.entry_price > Decimal::ZERO);
    }
    if let Some(b) = &s.side_bet {
        assert!(!b.resolved);
        assert!(b.amount > Decimal::ZERO);
        assert!(b.expiry_tick > b.placed_at_tick);
    }
}

#[test]
fn random_operations_keep_every_invariant() {
    let store = StateStore::new(StoreConfig::default(), None);
    let mut rng = StdRng::seed_from_u64(7);
    let mut seq = 0u64;

    for _ in 0..2_000 {
        let before = store.get_snapshot();
        let res = match rng.gen_range(0..7) {
            0 | 1 => {
                seq += rng.gen_range(1..3);
                let phase = if rng.gen_bool(0.8) { Phase::Active } else { Phase::Cooldown };
                let t = Tick { phase, ..tick("fuzz", seq, Decimal::new(rng.gen_range(500..2_000), 3)) };
                store.apply_tick(&t)
            }
            2 => store.open_position(Decimal::new(rng.gen_range(-5..200), 3)),
            3 => store.partial_close(Decimal::new(rng.gen_range(-2..12), 1)),
            4 => store.close_position(),
            5 => store.place_side_bet(Decimal::new(rng.gen_range(0..80), 3)),
            _ => store.update_balance(Decimal::new(rng.gen_range(-60..40), 3)),
        };
        let after = store.get_snapshot();
        assert_invariants(&after);
        match res {
            Ok(s) => assert!(s.version > before.version),
            // a rejected mutation leaves nothing behind
            Err(_) => assert_eq!(*after, *before),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_is_bounded_with_busy_workers_and_full_queues() {
    let bus = EventBus::new(BusConfig { capacity: 64, ..Default::default() });
    bus.subscribe("slow", Arc::new(|_ev: &EngineEvent| std::thread::sleep(std::time::Duration::from_millis(20))));
    let store = Arc::new(StateStore::new(StoreConfig::default(), Some(bus.clone())));
    let slow = |_i: &DecisionInput| -> Result<Decision, DecisionError> {
        std::thread::sleep(std::time::Duration::from_millis(100));
        Ok(Decision::noop("slow"))
    };
    let executor = DecisionExecutor::new(fast_executor(), store.clone(), Some(bus.clone()), Box::new(slow));
    let d = ReplayDispatcher::new(
        ReplayConfig { tick_interval_ms: 1, speed: 1.0, ..Default::default() },
        RecorderConfig::default(),
        store.clone(),
        Some(bus.clone()),
        Some(executor.clone()),
    );

    bus.start().unwrap();
    executor.start().unwrap();
    d.load((1..=10_000).map(|i| tick("long", i, dec!(1))).collect()).unwrap();
    d.play().unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(bus.pending() > 0);

    let started = Instant::now();
    d.stop().await.unwrap();
    executor.stop().await.unwrap();
    let _ = d.stop_recording().await;
    bus.stop().await.unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(d.state(), PlaybackState::Stopped);
    assert!(!executor.is_running());
    assert!(!bus.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callbacks_cannot_mutate_directly_but_can_submit_actions() {
    let bus = EventBus::new(BusConfig::default());
    let store = Arc::new(StateStore::new(StoreConfig::default(), Some(bus.clone())));
    let executor = DecisionExecutor::new(
        fast_executor(),
        store.clone(),
        Some(bus.clone()),
        Box::new(|_i: &DecisionInput| -> Result<Decision, DecisionError> { Ok(Decision::noop("idle")) }),
    );

    let direct = Arc::new(Mutex::new(None));
    {
        let store = store.clone();
        let executor = executor.clone();
        let direct = direct.clone();
        bus.subscribe(
            "trader",
            Arc::new(move |ev: &EngineEvent| {
                if let EngineEvent::TickApplied { tick, .. } = ev {
                    if tick.sequence_number == 1 {
                        *direct.lock() = Some(store.update_balance(dec!(1)).map(|_| ()));
                        executor.submit_action(Action::OpenPosition(dec!(0.01)));
                    }
                }
            }),
        );
    }
    bus.start().unwrap();
    executor.start().unwrap();

    let start = store.get_snapshot().balance;
    store.apply_tick(&tick("g1", 1, dec!(1))).unwrap();
    for _ in 0..200 {
        if store.get_snapshot().position.is_some() {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(*direct.lock(), Some(Err(EngineError::Reentrant { .. }))));
    let snap = store.get_snapshot();
    assert!(snap.position.is_some());
    assert_eq!(snap.balance, start - dec!(0.01));

    executor.stop().await.unwrap();
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn each_live_session_gets_its_own_recording() {
    let dir = tempfile::tempdir().unwrap();
    let rec = RecorderConfig { enabled: true, dir: dir.path().to_path_buf(), ..Default::default() };
    let bus = EventBus::new(BusConfig::default());
    let (_, mut rx) = bus.subscribe_channel("record", 1_024);
    bus.start().unwrap();
    let store = Arc::new(StateStore::new(StoreConfig::default(), Some(bus.clone())));
    let d = ReplayDispatcher::new(
        ReplayConfig { speed: 0.0, ..Default::default() },
        rec,
        store.clone(),
        Some(bus.clone()),
        None,
    );

    let pusher = d.attach_live().await.unwrap();
    for i in 1..=3 {
        assert!(pusher.push(tick("s1", i, dec!(1))));
    }
    for i in 1..=2 {
        assert!(pusher.push(tick("s2", i, dec!(1))));
    }
    for _ in 0..400 {
        if d.accepted() == 5 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(d.accepted(), 5);
    drop(pusher);
    wait_stopped(&d).await;

    assert!(bus.flush(Duration::from_secs(1)).await);
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    let summaries: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::RecordingStopped { summary } => Some(summary.clone()),
            _ => None,
        })
        .collect();
    let got: Vec<_> = summaries.iter().map(|s| (s.session_id.as_str(), s.tick_count)).collect();
    assert_eq!(got, vec![("s1", 3), ("s2", 2)]);
    for (name, lines) in [("s1.jsonl", 3), ("s2.jsonl", 2)] {
        let body = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(body.lines().count(), lines, "{name}");
    }

    // s1's recording is closed before s2 starts
    let s1_stopped = events
        .iter()
        .position(|e| matches!(e, EngineEvent::RecordingStopped { summary } if summary.session_id == "s1"))
        .unwrap();
    let s2_started = events
        .iter()
        .position(|e| matches!(e, EngineEvent::SessionStarted { session_id, .. } if session_id == "s2"))
        .unwrap();
    assert!(s1_stopped < s2_started);

    d.stop().await.unwrap();
    bus.stop().await.unwrap();
}
