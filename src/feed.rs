// ===============================
// src/feed.rs
// ===============================
//
// Tick sources:
// - load_file   : recorded session log (JSONL, one Tick per line), for replay
// - run_mock    : random-walk session generator, pushes live ticks
// - run_ws      : JSON ticks over a websocket, pushes live ticks
//
// Live sources never call into the dispatcher directly; they push through a
// `TickPusher` (non-blocking, drop + warn when the ingestion queue is full).
//
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt; // for .next()
use rand::Rng;
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{Phase, Tick};
use crate::error::{EngineError, EngineResult};

/// Result of reading a tick log: valid ticks in file order plus the lines
/// that could not be parsed.
#[derive(Debug, Default)]
pub struct LoadedTicks {
    pub ticks: Vec<Tick>,
    pub rejected: Vec<(usize, String)>,
}

/// Parse one log line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Option<EngineResult<Tick>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let parsed = serde_json::from_str::<Tick>(trimmed)
        .map_err(|e| EngineError::Malformed { reason: e.to_string() })
        .and_then(|t| t.validate().map(|_| t));
    Some(parsed)
}

/// Read a whole tick log. I/O errors abort the load; malformed lines are
/// collected and skipped.
pub async fn load_file(path: &Path) -> EngineResult<LoadedTicks> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut out = LoadedTicks::default();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_line(&line) {
            None => {}
            Some(Ok(t)) => out.ticks.push(t),
            Some(Err(e)) => {
                warn!(line = line_no, error = %e, "tick log: malformed line skipped");
                out.rejected.push((line_no, e.to_string()));
            }
        }
    }
    info!(path = %path.display(), ticks = out.ticks.len(), rejected = out.rejected.len(), "tick log loaded");
    Ok(out)
}

/// Registered push handle for live sources.
#[derive(Clone, Debug)]
pub struct TickPusher {
    tx: mpsc::Sender<Tick>,
    dropped: Arc<AtomicU64>,
}

impl TickPusher {
    pub fn new(tx: mpsc::Sender<Tick>) -> Self {
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Non-blocking. Returns false if the tick was dropped.
    pub fn push(&self, tick: Tick) -> bool {
        match self.tx.try_send(tick) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(t)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % 1_000 == 0 {
                    warn!(session = %t.session_id, seq = t.sequence_number, dropped = n, "ingestion queue full, tick dropped");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool { self.tx.is_closed() }
    pub fn dropped(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }
}

#[derive(Debug, Clone)]
pub struct MockFeedConfig {
    pub interval_ms: u64,
    pub max_session_ticks: u64,
    /// Chance per tick that the session ends (terminal tick, price -> 0).
    pub terminal_prob: f64,
    /// Stop after this many sessions (None = forever).
    pub sessions: Option<u64>,
}

impl Default for MockFeedConfig {
    fn default() -> Self {
        Self { interval_ms: 250, max_session_ticks: 500, terminal_prob: 0.005, sessions: None }
    }
}

fn now_ms() -> i64 { Utc::now().timestamp_millis() }

/// Generator session mock (random walk). Tiap session: beberapa tick PRESALE,
/// lalu ACTIVE, diakhiri satu tick terminal.
pub async fn run_mock(pusher: TickPusher, cfg: MockFeedConfig) {
    let mut session_no: u64 = 0;
    loop {
        if let Some(max) = cfg.sessions {
            if session_no >= max {
                break;
            }
        }
        session_no += 1;
        let session_id = format!("mock-{}-{}", now_ms(), session_no);
        info!(session = %session_id, "mock feed: new session");

        let mut price_milli: i64 = 1_000; // 1.000
        for seq in 1..=cfg.max_session_ticks {
            if pusher.is_closed() {
                return;
            }
            // jangan simpan ThreadRng melewati .await
            let (step, ends) = {
                let mut rng = rand::thread_rng();
                (rng.gen_range(-30..=35), rng.gen_bool(cfg.terminal_prob.clamp(0.0, 1.0)))
            };
            let last = ends || seq == cfg.max_session_ticks;
            let phase = if seq <= 5 { Phase::Presale } else if last { Phase::Rugged } else { Phase::Active };
            price_milli = if last { 0 } else { (price_milli + step).max(100) };

            pusher.push(Tick {
                session_id: session_id.clone(),
                sequence_number: seq,
                price: Decimal::new(price_milli, 3),
                phase,
                is_terminal: last,
                timestamp: now_ms(),
            });
            sleep(Duration::from_millis(cfg.interval_ms)).await;
            if last {
                break;
            }
        }
    }
    info!(sessions = session_no, "mock feed: done");
}

/// Adapter websocket: setiap text frame = satu Tick JSON.
/// Reconnect dengan exponential backoff + jitter sampai pusher ditutup.
pub async fn run_ws(pusher: TickPusher, ws_url: String) {
    let mut attempt: u32 = 0;
    loop {
        if pusher.is_closed() {
            return;
        }
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad ws url");
                return;
            }
        };

        info!(%ws_url, "connecting tick stream");
        match connect_async(url).await {
            Ok((mut ws, _resp)) => {
                info!(%ws_url, "tick stream connected");
                attempt = 0; // reset backoff

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(m) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            match parse_line(&txt) {
                                Some(Ok(t)) => {
                                    if !pusher.push(t) && pusher.is_closed() {
                                        return;
                                    }
                                }
                                Some(Err(e)) => warn!(error = %e, "ws: malformed tick dropped"),
                                None => {}
                            }
                        }
                        Ok(_) => {
                            // ignore non-text frames
                        }
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }
                info!("tick stream disconnected, will reconnect…");
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6);                  // 0..=6
        let factor = 1u64 << shift;                  // 1,2,4,...,64
        let base_ms = 500u64.saturating_mul(factor); // 0.5s..32s
        let jitter = rand::thread_rng().gen_range(0..=250);
        debug!(attempt, delay_ms = base_ms + jitter, "ws backoff");
        sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}
