use crate::config::Config;
use crate::influx::{InfluxSink, PointSink, SinkError};
use crate::pipeline::{FlushOutcome, IngestOutcome, Pipeline, PipelineSettings};
use crate::redis_bus::{BusError, MessageSource, RedisSubscriber};
use crate::stats::{LoggerStats, StatsReporter, StatsSnapshot, SupervisorState};
use anyhow::Error;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Opens the two connections the pipeline needs.
#[async_trait]
pub trait Connector: Send + Sync {
    type Source: MessageSource;
    type Sink: PointSink;

    async fn connect_bus(&self) -> Result<Self::Source, BusError>;
    async fn connect_sink(&self) -> Result<Self::Sink, SinkError>;
}

pub struct LiveConnector {
    config: Config,
}

impl LiveConnector {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for LiveConnector {
    type Source = RedisSubscriber;
    type Sink = InfluxSink;

    async fn connect_bus(&self) -> Result<RedisSubscriber, BusError> {
        RedisSubscriber::connect(&self.config).await
    }

    async fn connect_sink(&self) -> Result<InfluxSink, SinkError> {
        InfluxSink::connect(&self.config).await
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub stats_interval: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_timeout: config.poll_timeout(),
            reconnect_backoff: config.reconnect_backoff(),
            stats_interval: config.stats_interval(),
        }
    }
}

enum RunExit {
    Stopped,
    Failed(Error),
}

pub struct Supervisor<C: Connector> {
    connector: C,
    pipeline: Pipeline,
    reporter: StatsReporter,
    settings: SupervisorSettings,
    stats: Arc<LoggerStats>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        pipeline_settings: &PipelineSettings,
        settings: SupervisorSettings,
    ) -> Self {
        let stats = Arc::new(LoggerStats::new());
        let (stats_tx, _) = watch::channel(StatsSnapshot::empty(
            pipeline_settings.fresh_limit,
            pipeline_settings.backlog_limit,
        ));
        Self {
            connector,
            pipeline: Pipeline::new(pipeline_settings, stats.clone()),
            reporter: StatsReporter::new(settings.stats_interval, stats_tx),
            settings,
            stats,
        }
    }

    /// Snapshots published on every stats report, including while disconnected.
    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.reporter.subscribe()
    }

    fn transition(&self, next: SupervisorState) {
        let previous = self.stats.state();
        if previous != next {
            tracing::info!(from = ?previous, to = ?next, "supervisor state change");
        }
        self.stats.set_state(next);
    }

    /// Runs until `cancel` fires, then drains and returns the final snapshot.
    pub async fn run(mut self, cancel: CancellationToken) -> StatsSnapshot {
        let mut live_sink: Option<C::Sink> = None;

        while !cancel.is_cancelled() {
            let (mut source, sink) = match self.establish().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(
                        backoff_secs = self.settings.reconnect_backoff.as_secs_f64(),
                        "connection failed; retrying: {err:#}"
                    );
                    if self.backoff(&cancel).await {
                        continue;
                    }
                    break;
                }
            };

            self.transition(SupervisorState::Running);
            match self.run_connected(&mut source, &sink, &cancel).await {
                RunExit::Stopped => {
                    live_sink = Some(sink);
                    drop(source);
                    break;
                }
                RunExit::Failed(err) => {
                    tracing::warn!("pipeline failed; reconnecting: {err:#}");
                    drop(source);
                    drop(sink);
                    self.transition(SupervisorState::Reconnecting);
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    if !self.backoff(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.shutdown(live_sink).await
    }

    async fn establish(&self) -> anyhow::Result<(C::Source, C::Sink)> {
        self.transition(SupervisorState::Connecting);
        let source = self.connector.connect_bus().await?;
        let sink = self.connector.connect_sink().await?;
        Ok((source, sink))
    }

    /// Sleeps for the backoff, still reporting stats on schedule; returns
    /// false if cancelled first.
    async fn backoff(&mut self, cancel: &CancellationToken) -> bool {
        let deadline = tokio::time::Instant::now() + self.settings.reconnect_backoff;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = tokio::time::sleep(self.reporter.until_next_report()) => {
                    self.reporter.maybe_report(&self.stats, self.pipeline.buffer());
                }
            }
        }
    }

    async fn run_connected(
        &mut self,
        source: &mut C::Source,
        sink: &C::Sink,
        cancel: &CancellationToken,
    ) -> RunExit {
        loop {
            if cancel.is_cancelled() {
                return RunExit::Stopped;
            }

            match source.next_message(self.settings.poll_timeout).await {
                Ok(Some(mut payload)) => {
                    if let IngestOutcome::Processed { buffered, dropped } =
                        self.pipeline.ingest(&mut payload)
                    {
                        tracing::trace!(buffered, dropped, "message buffered");
                    }
                }
                Ok(None) => {}
                Err(err) => return RunExit::Failed(err.into()),
            }

            match self.pipeline.flush(sink, false).await {
                Ok(FlushOutcome::Flushed(report))
                    if report.fresh_written + report.backlog_written > 0 =>
                {
                    tracing::debug!(
                        fresh = report.fresh_written,
                        backlog = report.backlog_written,
                        "flush complete"
                    );
                }
                Ok(_) => {}
                Err(err) if err.is_connection_loss() => return RunExit::Failed(err.into()),
                Err(err) => {
                    tracing::warn!(error = %err, "write rejected; keeping connection");
                }
            }

            self.reporter.maybe_report(&self.stats, self.pipeline.buffer());
        }
    }

    async fn shutdown(mut self, live_sink: Option<C::Sink>) -> StatsSnapshot {
        self.transition(SupervisorState::ShuttingDown);

        if !self.pipeline.buffer().is_empty() {
            let sink = match live_sink {
                Some(sink) => Some(sink),
                None => match self.connector.connect_sink().await {
                    Ok(sink) => Some(sink),
                    Err(err) => {
                        tracing::error!(error = %err, "no sink for final flush");
                        None
                    }
                },
            };
            if let Some(sink) = sink {
                if let Err(err) = self.pipeline.flush(&sink, true).await {
                    tracing::error!(error = %err, "final flush failed");
                }
            }
            let lost = self.pipeline.abandon_buffered();
            if lost > 0 {
                tracing::warn!(lost, "points still buffered at shutdown were dropped");
            }
        }

        self.transition(SupervisorState::Closed);
        let snapshot = self.reporter.report(&self.stats, self.pipeline.buffer());
        tracing::info!("logger closed");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{digital_message, RecordingSink};
    use crate::telemetry::Point;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ChannelSource(mpsc::UnboundedReceiver<Vec<u8>>);

    #[async_trait]
    impl MessageSource for ChannelSource {
        async fn next_message(
            &mut self,
            timeout: Duration,
        ) -> Result<Option<Vec<u8>>, BusError> {
            match tokio::time::timeout(timeout, self.0.recv()).await {
                Err(_) => Ok(None),
                Ok(Some(payload)) => Ok(Some(payload)),
                Ok(None) => Err(BusError::Closed {
                    channel: "test".to_string(),
                }),
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<RecordingSink>);

    #[async_trait]
    impl PointSink for SharedSink {
        async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
            self.0.write(points).await
        }
    }

    struct TestConnector {
        sources: Mutex<Vec<mpsc::UnboundedReceiver<Vec<u8>>>>,
        sink: SharedSink,
        bus_failures: Mutex<usize>,
        bus_attempts: Arc<AtomicUsize>,
    }

    impl TestConnector {
        fn new(sources: Vec<mpsc::UnboundedReceiver<Vec<u8>>>, sink: SharedSink) -> Self {
            Self {
                sources: Mutex::new(sources),
                sink,
                bus_failures: Mutex::new(0),
                bus_attempts: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        type Source = ChannelSource;
        type Sink = SharedSink;

        async fn connect_bus(&self) -> Result<ChannelSource, BusError> {
            self.bus_attempts.fetch_add(1, Ordering::Relaxed);
            {
                let mut failures = self.bus_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(BusError::Address("unreachable".to_string()));
                }
            }
            let mut sources = self.sources.lock().unwrap();
            if sources.is_empty() {
                return Err(BusError::Address("no more sources".to_string()));
            }
            Ok(ChannelSource(sources.remove(0)))
        }

        async fn connect_sink(&self) -> Result<SharedSink, SinkError> {
            Ok(self.sink.clone())
        }
    }

    fn pipeline_settings() -> PipelineSettings {
        PipelineSettings {
            fresh_limit: 4,
            backlog_limit: 100,
            backlog_chunk: 10,
            samples_trigger: 4,
            time_trigger: Duration::from_secs(3600),
        }
    }

    fn supervisor_settings() -> SupervisorSettings {
        SupervisorSettings {
            poll_timeout: Duration::from_millis(5),
            reconnect_backoff: Duration::from_millis(10),
            stats_interval: Duration::from_secs(3600),
        }
    }

    fn supervisor(connector: TestConnector) -> Supervisor<TestConnector> {
        Supervisor::new(connector, &pipeline_settings(), supervisor_settings())
    }

    #[tokio::test]
    async fn drains_everything_on_shutdown() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = SharedSink::default();
        let connector = TestConnector::new(vec![rx], sink.clone());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(supervisor(connector).run(cancel.clone()));
        tx.send(digital_message(3)).unwrap();
        tx.send(br#"{"command": "ping"}"#.to_vec()).unwrap();
        tx.send(digital_message(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let snapshot = handle.await.unwrap();
        assert_eq!(snapshot.state, SupervisorState::Closed);
        assert_eq!(snapshot.messages_processed, 2);
        assert_eq!(snapshot.messages_ignored, 1);
        assert_eq!(snapshot.points_processed, 5);
        assert_eq!(snapshot.points_written, 5);
        assert_eq!(snapshot.points_dropped, 0);
        assert_eq!(snapshot.buffered(), 0);
        assert_eq!(sink.0.written(), 5);
    }

    #[tokio::test]
    async fn reconnects_after_write_failure_without_losing_points() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let sink = SharedSink(Arc::new(RecordingSink::failing(1)));
        let connector = TestConnector::new(vec![rx1, rx2], sink.clone());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(supervisor(connector).run(cancel.clone()));
        tx1.send(digital_message(4)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx2.send(digital_message(4)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let snapshot = handle.await.unwrap();
        assert_eq!(snapshot.write_errors, 1);
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.points_written, 8);
        assert_eq!(snapshot.points_dropped, 0);
        assert_eq!(sink.0.written(), 8);
    }

    #[tokio::test]
    async fn retries_connection_until_it_succeeds() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = SharedSink::default();
        let connector = TestConnector::new(vec![rx], sink.clone());
        *connector.bus_failures.lock().unwrap() = 3;
        let attempts = connector.bus_attempts.clone();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(supervisor(connector).run(cancel.clone()));
        tx.send(digital_message(4)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let snapshot = handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::Relaxed), 4);
        assert_eq!(snapshot.reconnects, 0);
        assert_eq!(snapshot.points_written, 4);
        assert_eq!(sink.0.written(), 4);
    }

    #[tokio::test]
    async fn shutdown_while_disconnected_still_flushes() {
        let sink = SharedSink::default();
        let connector = TestConnector::new(Vec::new(), sink.clone());
        let mut sup = supervisor(connector);
        sup.pipeline.ingest(&mut digital_message(3));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let snapshot = sup.run(cancel).await;
        assert_eq!(snapshot.points_written, 3);
        assert_eq!(snapshot.state, SupervisorState::Closed);
        assert_eq!(sink.0.written(), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let connector = TestConnector::new(Vec::new(), SharedSink::default());
        let mut settings = supervisor_settings();
        settings.reconnect_backoff = Duration::from_secs(3600);
        let sup = Supervisor::new(connector, &pipeline_settings(), settings);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(sup.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor stopped")
            .unwrap();
        assert_eq!(snapshot.state, SupervisorState::Closed);
    }

    #[tokio::test]
    async fn stats_keep_flowing_during_an_outage() {
        let connector = TestConnector::new(Vec::new(), SharedSink::default());
        let mut settings = supervisor_settings();
        settings.reconnect_backoff = Duration::from_secs(3600);
        settings.stats_interval = Duration::from_millis(10);
        let sup = Supervisor::new(connector, &pipeline_settings(), settings);
        let mut rx = sup.subscribe();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(sup.run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("snapshot published while disconnected")
            .unwrap();
        assert_eq!(rx.borrow().state, SupervisorState::Connecting);

        cancel.cancel();
        let snapshot = handle.await.unwrap();
        assert_eq!(snapshot.state, SupervisorState::Closed);
    }

    #[tokio::test]
    async fn reconnect_attempts_pass_through_connecting() {
        let connector = TestConnector::new(Vec::new(), SharedSink::default());
        let sup = supervisor(connector);
        sup.stats.set_state(SupervisorState::Reconnecting);

        assert!(sup.establish().await.is_err());
        assert_eq!(sup.stats.state(), SupervisorState::Connecting);
    }
}
