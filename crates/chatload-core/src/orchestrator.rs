use crate::config::{Config, MetricsDetail};
use crate::connection::{ConnectionManager, Connector};
use crate::error::RunError;
use crate::generator::MessageGenerator;
use crate::message::ChatMessage;
use crate::metrics::{LatencyStatistics, Metrics, PhaseReport, ThroughputBucket};
use crate::sender::{PhaseLimits, Sender, SenderSettings, SenderStats};
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long timed-out workers get to close their connections before being aborted.
const UNWIND_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub connector: String,
    pub started_at: String,
    /// Epoch milliseconds the throughput buckets are measured from
    pub baseline_ms: i64,
    pub generated: u64,
    pub warmup: PhaseReport,
    pub main: PhaseReport,
    pub total_success: u64,
    pub total_fail: u64,
    pub wall_time_secs: f64,
    pub throughput: f64,
    pub connections: u64,
    pub reconnections: u64,
    pub statistics: Option<LatencyStatistics>,
    pub throughput_over_time: Vec<ThroughputBucket>,
}

/// Two-phase load run: a fixed-count warmup, then a main phase that drains the queue.
pub struct LoadTest {
    config: Config,
    connector: Arc<dyn Connector>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl LoadTest {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let metrics = Arc::new(Metrics::new(config.output.detail));
        Self {
            config,
            connector,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Cancelling this token stops the generator and unwinds every worker.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let cfg = &self.config;
        let (tx, rx) = async_channel::bounded::<ChatMessage>(cfg.load.queue_capacity);

        let generator = MessageGenerator::new(cfg.load.total_messages, cfg.target.rooms, cfg.load.seed);
        let generator_handle = tokio::spawn(generator.run(tx, self.cancel.child_token()));

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(cfg.load.generator_head_start_ms)) => {}
        }

        let started_at = Utc::now();
        let baseline_ms = started_at.timestamp_millis();
        let started = Instant::now();
        let progress = self.spawn_progress(rx.clone(), started);

        let result = self.run_phases(&rx).await;
        progress.cancel();
        let (warmup, main) = match result {
            Ok(phases) => phases,
            Err(e) => {
                self.cancel.cancel();
                return Err(e);
            }
        };
        let wall_time = started.elapsed();

        let generated = match generator_handle.await {
            Ok(result) => result?,
            Err(e) => return Err(RunError::Generator(e.to_string())),
        };

        let snapshot = self.metrics.snapshot();
        let (statistics, throughput_over_time) = match self.metrics.detail() {
            MetricsDetail::Full => (
                self.metrics.statistics(cfg.output.percentiles),
                self.metrics.throughput_over_time(baseline_ms),
            ),
            MetricsDetail::Summary => (None, Vec::new()),
        };
        let overall = self.metrics.report("Overall", wall_time);

        Ok(RunSummary {
            connector: self.connector.name().to_string(),
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            baseline_ms,
            generated,
            warmup,
            main,
            total_success: snapshot.success,
            total_fail: snapshot.fail,
            wall_time_secs: overall.duration_secs,
            throughput: overall.throughput,
            connections: snapshot.connections,
            reconnections: snapshot.reconnections,
            statistics,
            throughput_over_time,
        })
    }

    async fn run_phases(
        &self,
        rx: &async_channel::Receiver<ChatMessage>,
    ) -> Result<(PhaseReport, PhaseReport), RunError> {
        let cfg = &self.config;

        let required = cfg.warmup.required_successes();
        info!(
            "Warmup phase: {} workers x {} messages ({} required successes)",
            cfg.warmup.workers, cfg.warmup.messages_per_worker, required
        );
        let remaining = Arc::new(AtomicI64::new(required as i64));
        let warmup = self
            .run_phase(
                "Warmup",
                cfg.warmup.workers,
                rx,
                PhaseLimits::warmup(cfg.warmup.messages_per_worker, remaining),
                Duration::from_secs(cfg.warmup.join_timeout_secs),
            )
            .await?;

        let outstanding = cfg
            .load
            .total_messages
            .saturating_sub(self.metrics.success_count());
        info!(
            "Main phase: {} workers, {} messages remaining",
            cfg.main.workers, outstanding
        );
        let main = self
            .run_phase(
                "Main",
                cfg.main.workers,
                rx,
                PhaseLimits::unlimited(),
                Duration::from_secs(cfg.main.join_timeout_secs),
            )
            .await?;

        Ok((warmup, main))
    }

    /// Run one worker pool to quiescence, bounded by `limit`.
    async fn run_phase(
        &self,
        phase: &str,
        workers: usize,
        rx: &async_channel::Receiver<ChatMessage>,
        limits: PhaseLimits,
        limit: Duration,
    ) -> Result<PhaseReport, RunError> {
        let connections = ConnectionManager::new(
            self.connector.clone(),
            self.metrics.clone(),
            self.config.target.connect_timeout(),
        );
        let settings = SenderSettings::from_config(&self.config);
        let phase_cancel = self.cancel.child_token();
        let rooms: Vec<u32> = {
            let mut rng = rand::thread_rng();
            (0..workers)
                .map(|_| rng.gen_range(1..=self.config.target.rooms))
                .collect()
        };

        let baseline = self.metrics.snapshot();
        let started = Instant::now();

        let mut set = JoinSet::new();
        for (id, room) in rooms.into_iter().enumerate() {
            let sender = Sender::new(
                id,
                room,
                rx.clone(),
                connections.clone(),
                self.metrics.clone(),
                settings.clone(),
                limits.clone(),
                phase_cancel.clone(),
            );
            set.spawn(sender.run());
        }

        let mut totals = SenderStats::default();
        let joined = tokio::time::timeout(limit, async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(stats) => totals += stats,
                    Err(e) => warn!("{} worker ended abnormally: {}", phase, e),
                }
            }
        })
        .await;

        if joined.is_err() {
            error!("{} phase exceeded {:?}; cancelling {} workers", phase, limit, set.len());
            phase_cancel.cancel();
            let _ = tokio::time::timeout(UNWIND_GRACE, async {
                while set.join_next().await.is_some() {}
            })
            .await;
            set.abort_all();
            return Err(RunError::PhaseTimeout {
                phase: phase.to_string(),
                limit,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let report = self.metrics.report_since(phase, &baseline, started.elapsed());
        info!(
            "{} phase done: {} ok, {} failed, {} attempts, {:.2}s, {:.0} msg/s",
            phase,
            report.successes,
            report.failures,
            totals.attempts,
            report.duration_secs,
            report.throughput
        );
        Ok(report)
    }

    fn spawn_progress(&self, queue: async_channel::Receiver<ChatMessage>, started: Instant) -> CancellationToken {
        let token = self.cancel.child_token();
        let interval_ms = self.config.output.progress_interval_ms;
        if interval_ms == 0 {
            return token;
        }

        let metrics = self.metrics.clone();
        let stop = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = metrics.report("Progress", started.elapsed());
                        info!(
                            "Progress: ok={} failed={} queued={} connections={} reconnections={} tps={:.0}",
                            report.successes,
                            report.failures,
                            queue.len(),
                            report.connections,
                            report.reconnections,
                            report.throughput
                        );
                    }
                }
            }
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockConnector};

    fn small_config(total: u64) -> Config {
        let mut config = Config::default();
        config.load.total_messages = total;
        config.load.queue_capacity = 16;
        config.load.generator_head_start_ms = 10;
        config.warmup.workers = 4;
        config.warmup.messages_per_worker = 5;
        config.main.workers = 8;
        config.output.progress_interval_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_two_phase_run_accounts_every_message() {
        let connector = Arc::new(MockConnector::new(MockBehavior::AlwaysOk));
        let test = LoadTest::new(small_config(200), connector.clone());

        let summary = test.run().await.unwrap();
        assert_eq!(summary.generated, 200);
        assert_eq!(summary.warmup.successes, 20);
        assert_eq!(summary.main.successes, 180);
        assert_eq!(summary.total_success, 200);
        assert_eq!(summary.total_fail, 0);
        assert_eq!(summary.connections, 12);
        assert_eq!(connector.closes(), 12);

        let stats = summary.statistics.unwrap();
        assert_eq!(stats.total_records, 200);
        let bucketed: u64 = summary.throughput_over_time.iter().map(|b| b.messages).sum();
        assert_eq!(bucketed, 200);
    }

    #[tokio::test]
    async fn test_summary_detail_skips_latency_log() {
        let mut config = small_config(50);
        config.output.detail = MetricsDetail::Summary;
        let test = LoadTest::new(config, Arc::new(MockConnector::new(MockBehavior::AlwaysOk)));

        let summary = test.run().await.unwrap();
        assert_eq!(summary.total_success, 50);
        assert!(summary.statistics.is_none());
        assert!(summary.throughput_over_time.is_empty());
        assert_eq!(test.metrics().record_count(), 0);
    }

    #[tokio::test]
    async fn test_fewer_messages_than_warmup_quota() {
        let test = LoadTest::new(small_config(7), Arc::new(MockConnector::new(MockBehavior::AlwaysOk)));

        let summary = test.run().await.unwrap();
        assert_eq!(summary.warmup.successes, 7);
        assert_eq!(summary.main.successes, 0);
        assert_eq!(summary.total_success, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_timeout_is_fatal() {
        let mut config = small_config(20);
        config.warmup.join_timeout_secs = 60;
        config.target.response_timeout_ms = 120_000;
        let connector = Arc::new(MockConnector::new(MockBehavior::NeverRespond));
        let test = LoadTest::new(config, connector.clone());

        let err = test.run().await.err().unwrap();
        assert!(matches!(err, RunError::PhaseTimeout { ref phase, .. } if phase == "Warmup"), "{err}");
        assert_eq!(test.metrics().fail_count(), 0);
        assert_eq!(connector.closes(), 4);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let test = LoadTest::new(small_config(100), Arc::new(MockConnector::new(MockBehavior::AlwaysOk)));
        test.cancel_token().cancel();
        assert!(matches!(test.run().await, Err(RunError::Cancelled)));
    }
}
