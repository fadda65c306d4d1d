// ===============================
// src/recorder.rs
// ===============================
//
// Per-session JSONL recorder yang ringan & tahan banting:
// - Satu file per session: <dir>/<session_id>.jsonl (append).
// - record() cuma try_send ke channel; disk I/O ada di task writer sendiri.
// - Bufer dengan BufWriter; flush tiap N tick dan tiap interval.
// - Parent directory dibuat otomatis.
// - Jika tulis gagal, coba reopen file sekali lalu lanjut.
//
use std::path::{Path, PathBuf};

use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::config::RecorderConfig;
use crate::domain::{RecordingSummary, Tick};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{RECORDED_BYTES, RECORDED_TICKS};

struct Active {
    session_id: String,
    path: PathBuf,
    tx: mpsc::Sender<Tick>,
    handle: JoinHandle<WriterStats>,
}

#[derive(Debug, Default, Clone, Copy)]
struct WriterStats {
    ticks: u64,
    bytes: u64,
}

/// Buffered append-only writer of accepted ticks, one log per session.
pub struct RecordingSink {
    cfg: RecorderConfig,
    active: Option<Active>,
    dropped: u64,
}

impl RecordingSink {
    pub fn new(cfg: RecorderConfig) -> Self {
        Self { cfg, active: None, dropped: 0 }
    }

    pub fn is_enabled(&self) -> bool { self.cfg.enabled }
    pub fn is_recording(&self) -> bool { self.active.is_some() }
    pub fn session_id(&self) -> Option<&str> { self.active.as_ref().map(|a| a.session_id.as_str()) }

    /// Ticks dropped because the writer channel was full.
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.cfg.dir.join(format!("{safe}.jsonl"))
    }

    /// Open `<dir>/<session_id>.jsonl` and spawn its writer task.
    pub async fn start(&mut self, session_id: &str) -> EngineResult<PathBuf> {
        if self.active.is_some() {
            return Err(EngineError::AlreadyRunning { worker: "recorder" });
        }
        let path = self.path_for(session_id);
        let writer = open_writer(&path).await?;
        let (tx, rx) = mpsc::channel::<Tick>(self.cfg.channel_capacity.max(1));
        let handle = tokio::spawn(run_writer(rx, writer, path.clone(), self.cfg.clone()));
        info!(session = %session_id, path = %path.display(), "recorder: started");
        self.active = Some(Active { session_id: session_id.to_string(), path: path.clone(), tx, handle });
        Ok(path)
    }

    /// Hand a tick to the writer without waiting on disk. A full channel
    /// drops the tick with a warning.
    pub fn record(&mut self, tick: &Tick) {
        let Some(active) = &self.active else { return };
        if active.tx.try_send(tick.clone()).is_err() {
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 1_000 == 0 {
                warn!(session = %active.session_id, dropped = self.dropped, "recorder: channel full, tick dropped");
            }
        }
    }

    /// Close the channel, let the writer flush, and report what was written.
    pub async fn stop(&mut self) -> Option<RecordingSummary> {
        let active = self.active.take()?;
        drop(active.tx);
        let stats = match active.handle.await {
            Ok(s) => s,
            Err(e) => {
                error!(?e, "recorder: writer task failed");
                WriterStats::default()
            }
        };
        let summary = RecordingSummary {
            session_id: active.session_id,
            path: active.path.display().to_string(),
            tick_count: stats.ticks,
            byte_count: stats.bytes,
        };
        info!(session = %summary.session_id, ticks = summary.tick_count, bytes = summary.byte_count, "recorder: stopped");
        Some(summary)
    }
}

async fn open_writer(path: &Path) -> EngineResult<BufWriter<tokio::fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await
}

async fn run_writer(
    mut rx: mpsc::Receiver<Tick>,
    mut writer: BufWriter<tokio::fs::File>,
    path: PathBuf,
    cfg: RecorderConfig,
) -> WriterStats {
    let mut stats = WriterStats::default();

    // Flush periodik + flush berbasis jumlah tick
    let mut tick = interval(Duration::from_millis(cfg.flush_interval_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(t) => {
                        let line = match serde_json::to_vec(&t) {
                            Ok(v) => v,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip tick");
                                continue;
                            }
                        };

                        if let Err(e) = write_line(&mut writer, &line).await {
                            error!(?e, "recorder: write failed, attempting reopen");
                            writer = match open_writer(&path).await {
                                Ok(w) => w,
                                Err(e2) => {
                                    error!(?e2, "recorder: reopen failed, stopping writer");
                                    break;
                                }
                            };
                            // coba lagi sekali setelah reopen
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop tick");
                                continue;
                            }
                        }

                        let n = line.len() as u64 + 1;
                        stats.ticks += 1;
                        stats.bytes += n;
                        RECORDED_TICKS.inc();
                        RECORDED_BYTES.inc_by(n);

                        since_last_flush += 1;
                        if since_last_flush >= cfg.flush_every.max(1) {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => break,
                }
            }

            _ = tick.tick() => {
                if since_last_flush > 0 {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
        }
    }

    // Channel closed: flush dan keluar
    if let Err(e) = writer.flush().await {
        error!(?e, "recorder: final flush failed");
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Phase;
    use rust_decimal_macros::dec;

    fn tick(seq: u64) -> Tick {
        Tick { session_id: "s-1".into(), sequence_number: seq, price: dec!(1.5), phase: Phase::Active, is_terminal: false, timestamp: 7 }
    }

    #[tokio::test]
    async fn writes_one_line_per_tick_and_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecorderConfig { enabled: true, dir: dir.path().join("rec"), ..Default::default() };
        let mut sink = RecordingSink::new(cfg);
        let path = sink.start("s-1").await.unwrap();
        for i in 1..=3 {
            sink.record(&tick(i));
        }
        let summary = sink.stop().await.unwrap();
        assert_eq!(summary.tick_count, 3);

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 3);
        assert_eq!(summary.byte_count, body.len() as u64);
        let back: Tick = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(back, tick(1));
        assert!(!sink.is_recording());
    }

    #[tokio::test]
    async fn second_start_without_stop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecorderConfig { enabled: true, dir: dir.path().to_path_buf(), ..Default::default() };
        let mut sink = RecordingSink::new(cfg);
        sink.start("a").await.unwrap();
        assert!(matches!(sink.start("b").await, Err(EngineError::AlreadyRunning { .. })));
        assert!(sink.stop().await.is_some());
        assert!(sink.stop().await.is_none());
    }

    #[test]
    fn session_ids_are_sanitized_into_file_names() {
        let sink = RecordingSink::new(RecorderConfig { dir: PathBuf::from("/tmp/x"), ..Default::default() });
        assert_eq!(sink.path_for("a/b c"), PathBuf::from("/tmp/x/a_b_c.jsonl"));
    }
}
