use serde::Serialize;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub id: String,
    pub mode: &'static str,
    pub timestamp: u64,
}

impl EventStarted {
    pub fn new(id: &str, mode: &'static str) -> Self {
        Self {
            event: "started",
            id: id.to_string(),
            mode,
            timestamp: now_secs(),
        }
    }
}

#[derive(Serialize)]
pub struct EventEcho {
    pub event: &'static str,
    pub from: String,
    pub addr: String,
    pub bytes: usize,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventPing {
    pub event: &'static str,
    pub seq: u32,
    pub rtt_ms: f64,
    pub path_rtt_ms: f64,
    pub connection: usize,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventPingFailed {
    pub event: &'static str,
    pub seq: u32,
    pub error: String,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub sent: u32,
    pub received: u32,
    pub avg_rtt_ms: f64,
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub connections: usize,
}

impl EventSummary {
    pub fn from_rtts(sent: u32, rtts: &[f64], connections: usize) -> Self {
        let received = rtts.len() as u32;
        let (min, max, sum) = rtts.iter().fold(
            (f64::INFINITY, 0.0_f64, 0.0_f64),
            |(min, max, sum), &rtt| (min.min(rtt), max.max(rtt), sum + rtt),
        );
        Self {
            event: "summary",
            sent,
            received,
            avg_rtt_ms: if received > 0 { sum / received as f64 } else { 0.0 },
            min_rtt_ms: if received > 0 { min } else { 0.0 },
            max_rtt_ms: max,
            connections,
        }
    }
}
