// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : replay_bot_rust — tick replay / live ingestion engine in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Replays recorded session ticks or ingests a live push feed into a
          simulated trading state, runs a pluggable decision function off the
          ingestion path, publishes every mutation on an async event bus,
          records live sessions to JSONL and exposes Prometheus metrics.
=============================================================================
*/
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use rust_decimal::Decimal;

/// Sumber tick untuk mode live
#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LiveMode {
    /// Random-walk session generator (no network)
    Mock,
    /// JSON ticks over a websocket
    Ws,
}

#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyMode {
    Passive,
    #[value(alias = "mean_reversion")]
    MeanReversion,
}

impl StrategyMode {
    pub fn label(&self) -> &'static str {
        match self {
            StrategyMode::Passive => "passive",
            StrategyMode::MeanReversion => "mean_reversion",
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(name = "replay_bot", about = "Tick replay / live ingestion engine")]
pub struct Args {
    /// JSONL tick file to replay
    #[arg(long, env = "REPLAY_FILE", conflicts_with = "live")]
    pub replay: Option<PathBuf>,

    /// Ingest a live push feed instead of replaying a file
    #[arg(long, env = "LIVE_MODE", value_enum)]
    pub live: Option<LiveMode>,

    #[arg(long, env = "WS_URL", default_value = "ws://127.0.0.1:9001/ticks")]
    pub ws_url: String,

    /// Playback speed multiplier (0 = as fast as possible)
    #[arg(long, env = "SPEED", default_value_t = 1.0)]
    pub speed: f64,

    /// Directory for per-session recordings (live mode only)
    #[arg(long, env = "RECORD_DIR")]
    pub record_dir: Option<PathBuf>,

    #[arg(long, env = "STRATEGY", value_enum, default_value = "passive")]
    pub strategy: StrategyMode,

    /// Wait for the decision worker on every replayed tick
    #[arg(long, env = "LOCKSTEP", default_value_t = false)]
    pub lockstep: bool,

    #[arg(long, env = "INITIAL_BALANCE", default_value = "0.100")]
    pub initial_balance: Decimal,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub initial_balance: Decimal,
    /// Jumlah maksimum entri transaction log yang disimpan (oldest evicted)
    pub history_capacity: usize,
    pub lock_timeout_ms: u64,
    pub sidebet_window_ticks: u64,
    /// Payout on a won side bet, stake included.
    pub sidebet_payout_multiplier: Decimal,
    pub max_position_amount: Option<Decimal>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::new(100, 3), // 0.100
            history_capacity: 10_000,
            lock_timeout_ms: 1_000,
            sidebet_window_ticks: 40,
            sidebet_payout_multiplier: Decimal::from(5),
            max_position_amount: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BusConfig {
    pub capacity: usize,
    pub poll_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 5_000, poll_interval_ms: 50, drain_timeout_ms: 500, join_timeout_ms: 2_000 }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub decision_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_stale_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { decision_timeout_ms: 500, poll_interval_ms: 50, heartbeat_stale_ms: 5_000, join_timeout_ms: 2_000 }
    }
}

#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub tick_interval_ms: u64,
    /// 1.0 = real time, 0.0 = no sleep between ticks.
    pub speed: f64,
    pub ring_capacity: usize,
    pub lockstep: bool,
    pub lockstep_timeout_ms: u64,
    pub live_queue_capacity: usize,
    pub join_timeout_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            speed: 1.0,
            ring_capacity: 5_000,
            lockstep: false,
            lockstep_timeout_ms: 2_000,
            live_queue_capacity: 4_096,
            join_timeout_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub flush_every: u32,
    pub flush_interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("recordings"),
            flush_every: 1_000,
            flush_interval_ms: 1_000,
            channel_capacity: 8_192,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub executor: ExecutorConfig,
    pub replay: ReplayConfig,
    pub recorder: RecorderConfig,
}

impl EngineConfig {
    pub fn from_args(args: &Args) -> Self {
        let mut cfg = EngineConfig::default();
        cfg.store.initial_balance = args.initial_balance;
        cfg.replay.speed = args.speed.max(0.0);
        cfg.replay.lockstep = args.lockstep;
        if let Some(dir) = &args.record_dir {
            cfg.recorder.enabled = true;
            cfg.recorder.dir = dir.clone();
        }
        cfg
    }
}

pub fn load() -> (Args, EngineConfig) {
    // Pastikan .env dibaca dulu (REPLAY_FILE, LIVE_MODE, dll)
    let _ = dotenv();
    let args = Args::parse();
    let cfg = EngineConfig::from_args(&args);
    (args, cfg)
}
