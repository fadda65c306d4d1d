// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingestion --------
pub static TICKS_APPLIED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_applied_total", "ticks committed to the state store").unwrap());

pub static TICKS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_rejected_total", "ticks dropped before commit (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static PLAYBACK_STATE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("playback_state", "0=stopped 1=playing 2=paused 3=live").unwrap()
});

// -------- State store --------
pub static MUTATIONS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mutations_rejected_total", "rejected mutations (label: field)"),
        &["field"],
    )
    .unwrap()
});

pub static BALANCE_MILLI: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("balance_milli", "current balance x 1000").unwrap());

// -------- Event bus --------
pub static EVENTS_PUBLISHED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("events_published_total", "events enqueued on the bus").unwrap());

pub static EVENTS_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("events_dropped_total", "events evicted on queue overflow").unwrap());

pub static SUBSCRIBER_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("subscriber_failures_total", "panicking subscriber callbacks").unwrap());

// -------- Decision executor --------
pub static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("decisions_total", "decisions (label: action)"), &["action"]).unwrap()
});

pub static DECISION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("decision_failures_total", "decision errors (label: kind = error|panic|timeout)"),
        &["kind"],
    )
    .unwrap()
});

pub static MAILBOX_REPLACED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("executor_mailbox_replaced_total", "stale snapshots replaced before evaluation").unwrap()
});

pub static HEARTBEAT_AGE_MS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("executor_heartbeat_age_ms", "age of the executor heartbeat").unwrap());

// -------- Recorder --------
pub static RECORDED_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("recorded_ticks_total", "ticks written to recordings").unwrap());

pub static RECORDED_BYTES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("recorded_bytes_total", "bytes written to recordings").unwrap());

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        // Register all metrics to the custom registry
        for m in [
            REGISTRY.register(Box::new(TICKS_APPLIED.clone())),
            REGISTRY.register(Box::new(TICKS_REJECTED.clone())),
            REGISTRY.register(Box::new(PLAYBACK_STATE.clone())),
            REGISTRY.register(Box::new(MUTATIONS_REJECTED.clone())),
            REGISTRY.register(Box::new(BALANCE_MILLI.clone())),
            REGISTRY.register(Box::new(EVENTS_PUBLISHED.clone())),
            REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
            REGISTRY.register(Box::new(SUBSCRIBER_FAILURES.clone())),
            REGISTRY.register(Box::new(DECISIONS.clone())),
            REGISTRY.register(Box::new(DECISION_FAILURES.clone())),
            REGISTRY.register(Box::new(MAILBOX_REPLACED.clone())),
            REGISTRY.register(Box::new(HEARTBEAT_AGE_MS.clone())),
            REGISTRY.register(Box::new(RECORDED_TICKS.clone())),
            REGISTRY.register(Box::new(RECORDED_BYTES.clone())),
        ] {
            if let Err(e) = m {
                error!(?e, "metric registration failed");
            }
        }
    });
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, ?e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_encodes() {
        init();
        init();
        TICKS_APPLIED.inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("ticks_applied_total"));
    }
}
