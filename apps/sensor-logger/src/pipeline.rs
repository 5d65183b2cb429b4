use crate::buffer::TieredBuffer;
use crate::config::Config;
use crate::influx::{PointSink, SinkError};
use crate::stats::LoggerStats;
use crate::telemetry::{convert_message, decode_message, Decoded};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub fresh_limit: usize,
    pub backlog_limit: usize,
    pub backlog_chunk: usize,
    pub samples_trigger: usize,
    pub time_trigger: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fresh_limit: config.fresh_limit,
            backlog_limit: config.backlog_limit,
            backlog_chunk: config.backlog_chunk,
            samples_trigger: config.samples_trigger,
            time_trigger: config.time_trigger(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Ignored,
    Dropped,
    Processed { buffered: usize, dropped: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub fresh_written: usize,
    pub backlog_written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped,
    Flushed(FlushReport),
}

/// Decides when a flush attempt is due.
#[derive(Debug)]
pub struct FlushScheduler {
    samples_trigger: usize,
    time_trigger: Duration,
    last_attempt: Instant,
}

impl FlushScheduler {
    pub fn new(samples_trigger: usize, time_trigger: Duration) -> Self {
        Self {
            samples_trigger: samples_trigger.max(1),
            time_trigger,
            last_attempt: Instant::now(),
        }
    }

    pub fn is_due(&self, fresh_len: usize, force: bool) -> bool {
        force
            || fresh_len >= self.samples_trigger
            || self.last_attempt.elapsed() >= self.time_trigger
    }

    pub fn mark_attempt(&mut self) {
        self.last_attempt = Instant::now();
    }

    #[cfg(test)]
    pub fn since_last_attempt(&self) -> Duration {
        self.last_attempt.elapsed()
    }
}

/// Owns the buffered points. Exactly one task drives it.
pub struct Pipeline {
    buffer: TieredBuffer,
    scheduler: FlushScheduler,
    backlog_chunk: usize,
    stats: Arc<LoggerStats>,
}

impl Pipeline {
    pub fn new(settings: &PipelineSettings, stats: Arc<LoggerStats>) -> Self {
        Self {
            buffer: TieredBuffer::new(settings.fresh_limit, settings.backlog_limit),
            scheduler: FlushScheduler::new(
                settings.samples_trigger.min(settings.fresh_limit),
                settings.time_trigger,
            ),
            backlog_chunk: settings.backlog_chunk.max(1),
            stats,
        }
    }

    pub fn buffer(&self) -> &TieredBuffer {
        &self.buffer
    }

    #[cfg(test)]
    pub fn stats(&self) -> &Arc<LoggerStats> {
        &self.stats
    }

    /// Decodes, converts and buffers one bus payload.
    pub fn ingest(&mut self, payload: &mut [u8]) -> IngestOutcome {
        let message = match decode_message(payload, Utc::now()) {
            Ok(Decoded::Data(message)) => message,
            Ok(Decoded::Ignored) => {
                self.stats.messages_ignored.fetch_add(1, Ordering::Relaxed);
                return IngestOutcome::Ignored;
            }
            Err(err) => {
                let samples = err.sample_count();
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .points_processed
                    .fetch_add(samples as u64, Ordering::Relaxed);
                self.stats.add_points_dropped(samples);
                tracing::warn!(error = %err, "dropping malformed message");
                return IngestOutcome::Dropped;
            }
        };

        self.stats
            .points_processed
            .fetch_add(message.samples.len() as u64, Ordering::Relaxed);
        let conversion = convert_message(message);
        for failure in &conversion.failures {
            tracing::debug!(error = %failure, "dropping sample");
        }
        let mut dropped = conversion.failures.len();

        let admission = self.buffer.admit(conversion.points);
        if admission.dropped > 0 {
            tracing::warn!(
                dropped = admission.dropped,
                backlog = self.buffer.backlog_len(),
                "buffers full; dropping new points"
            );
        }
        dropped += admission.dropped;
        self.stats.add_points_dropped(dropped);
        self.stats.messages_processed.fetch_add(1, Ordering::Relaxed);

        IngestOutcome::Processed {
            buffered: admission.fresh + admission.backlog,
            dropped,
        }
    }

    /// One trigger-gated flush attempt: fresh first, then one backlog chunk.
    pub async fn flush(
        &mut self,
        sink: &(dyn PointSink + '_),
        force: bool,
    ) -> Result<FlushOutcome, SinkError> {
        if !self.scheduler.is_due(self.buffer.fresh_len(), force) {
            return Ok(FlushOutcome::Skipped);
        }
        let result = self.write_buffers(sink).await;
        self.scheduler.mark_attempt();
        result.map(FlushOutcome::Flushed)
    }

    async fn write_buffers(
        &mut self,
        sink: &(dyn PointSink + '_),
    ) -> Result<FlushReport, SinkError> {
        let mut report = FlushReport::default();

        if self.buffer.fresh_len() > 0 {
            let len = self.buffer.fresh_len();
            let result = sink.write(self.buffer.fresh()).await;
            match result {
                Ok(()) => {
                    self.buffer.clear_fresh();
                    self.stats.record_write(len);
                    report.fresh_written = len;
                }
                Err(err) => {
                    let dropped = self.buffer.demote_fresh();
                    self.stats.add_points_dropped(dropped);
                    self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        error = %err,
                        demoted = len - dropped,
                        dropped,
                        "fresh write failed; moved points to backlog"
                    );
                    return Err(err);
                }
            }
        }

        if self.buffer.backlog_len() > 0 {
            let chunk = self.buffer.backlog_chunk(self.backlog_chunk);
            let len = chunk.len();
            let result = sink.write(chunk).await;
            match result {
                Ok(()) => {
                    self.buffer.release_backlog(len);
                    self.stats.record_write(len);
                    report.backlog_written = len;
                    tracing::debug!(
                        len,
                        remaining = self.buffer.backlog_len(),
                        "drained backlog chunk"
                    );
                }
                Err(err) => {
                    self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        error = %err,
                        backlog = self.buffer.backlog_len(),
                        "backlog write failed; chunk kept"
                    );
                    return Err(err);
                }
            }
        }

        Ok(report)
    }

    /// Counts whatever is still buffered as dropped and empties the tiers.
    pub fn abandon_buffered(&mut self) -> usize {
        let lost = self.buffer.discard_all();
        self.stats.add_points_dropped(lost);
        lost
    }
}
