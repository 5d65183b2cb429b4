use crate::buffer::TieredBuffer;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Connecting,
    Running,
    Reconnecting,
    ShuttingDown,
    Closed,
}

impl SupervisorState {
    fn as_u8(self) -> u8 {
        match self {
            SupervisorState::Connecting => 0,
            SupervisorState::Running => 1,
            SupervisorState::Reconnecting => 2,
            SupervisorState::ShuttingDown => 3,
            SupervisorState::Closed => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SupervisorState::Running,
            2 => SupervisorState::Reconnecting,
            3 => SupervisorState::ShuttingDown,
            4 => SupervisorState::Closed,
            _ => SupervisorState::Connecting,
        }
    }
}

/// Process-wide counters. Only the pipeline task writes them.
#[derive(Debug)]
pub struct LoggerStats {
    pub messages_processed: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub messages_ignored: AtomicU64,
    pub points_processed: AtomicU64,
    pub points_dropped: AtomicU64,
    pub points_written: AtomicU64,
    pub write_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_write_unix_ms: AtomicU64,
    state: AtomicU8,
}

impl Default for LoggerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerStats {
    pub fn new() -> Self {
        Self {
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_ignored: AtomicU64::new(0),
            points_processed: AtomicU64::new(0),
            points_dropped: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_write_unix_ms: AtomicU64::new(0),
            state: AtomicU8::new(SupervisorState::Connecting.as_u8()),
        }
    }

    pub fn add_points_dropped(&self, count: usize) {
        if count > 0 {
            self.points_dropped.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn record_write(&self, count: usize) {
        self.points_written.fetch_add(count as u64, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_write_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: SupervisorState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self, buffer: &TieredBuffer, uptime: Duration) -> StatsSnapshot {
        let last_write = self.last_write_unix_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            state: self.state(),
            uptime_secs: uptime.as_secs(),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_ignored: self.messages_ignored.load(Ordering::Relaxed),
            points_processed: self.points_processed.load(Ordering::Relaxed),
            points_dropped: self.points_dropped.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_write_unix_ms: (last_write != 0).then_some(last_write),
            fresh_len: buffer.fresh_len(),
            fresh_limit: buffer.fresh_limit(),
            backlog_len: buffer.backlog_len(),
            backlog_limit: buffer.backlog_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub state: SupervisorState,
    pub uptime_secs: u64,
    pub messages_processed: u64,
    pub messages_dropped: u64,
    pub messages_ignored: u64,
    pub points_processed: u64,
    pub points_dropped: u64,
    pub points_written: u64,
    pub write_errors: u64,
    pub reconnects: u64,
    pub last_write_unix_ms: Option<u64>,
    pub fresh_len: usize,
    pub fresh_limit: usize,
    pub backlog_len: usize,
    pub backlog_limit: usize,
}

impl StatsSnapshot {
    pub fn empty(fresh_limit: usize, backlog_limit: usize) -> Self {
        Self {
            state: SupervisorState::Connecting,
            uptime_secs: 0,
            messages_processed: 0,
            messages_dropped: 0,
            messages_ignored: 0,
            points_processed: 0,
            points_dropped: 0,
            points_written: 0,
            write_errors: 0,
            reconnects: 0,
            last_write_unix_ms: None,
            fresh_len: 0,
            fresh_limit,
            backlog_len: 0,
            backlog_limit,
        }
    }

    #[cfg(test)]
    pub fn buffered(&self) -> u64 {
        (self.fresh_len + self.backlog_len) as u64
    }
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// Emits a snapshot every `interval`, driven from the pipeline loop.
pub struct StatsReporter {
    interval: Duration,
    started_at: Instant,
    last_report: Instant,
    tx: watch::Sender<StatsSnapshot>,
}

impl StatsReporter {
    pub fn new(interval: Duration, tx: watch::Sender<StatsSnapshot>) -> Self {
        let now = Instant::now();
        Self {
            interval,
            started_at: now,
            last_report: now,
            tx,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.tx.subscribe()
    }

    /// Time left before `maybe_report` would emit again.
    pub fn until_next_report(&self) -> Duration {
        self.interval.saturating_sub(self.last_report.elapsed())
    }

    pub fn maybe_report(&mut self, stats: &LoggerStats, buffer: &TieredBuffer) -> bool {
        if self.last_report.elapsed() < self.interval {
            return false;
        }
        self.report(stats, buffer);
        true
    }

    pub fn report(&mut self, stats: &LoggerStats, buffer: &TieredBuffer) -> StatsSnapshot {
        self.last_report = Instant::now();
        let snapshot = stats.snapshot(buffer, self.uptime());
        tracing::info!(
            uptime = %format_uptime(self.uptime()),
            state = ?snapshot.state,
            fresh = snapshot.fresh_len,
            fresh_limit = snapshot.fresh_limit,
            backlog = snapshot.backlog_len,
            backlog_limit = snapshot.backlog_limit,
            messages_processed = snapshot.messages_processed,
            messages_dropped = snapshot.messages_dropped,
            points_written = snapshot.points_written,
            points_dropped = snapshot.points_dropped,
            write_errors = snapshot.write_errors,
            reconnects = snapshot.reconnects,
            "logger stats"
        );
        self.tx.send_replace(snapshot.clone());
        snapshot
    }
}
