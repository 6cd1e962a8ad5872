use crate::config::{Config, RetryConfig};
use crate::connection::{Connection, ConnectionManager};
use crate::error::ConnectionError;
use crate::message::{ChatMessage, ChatResponse};
use crate::metrics::{LatencyRecord, Metrics};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timing and retry settings shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub retry: RetryConfig,
    pub response_timeout: Duration,
    pub dequeue_timeout: Duration,
}

impl SenderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry.clone(),
            response_timeout: config.target.response_timeout(),
            dequeue_timeout: Duration::from_millis(config.load.dequeue_timeout_ms),
        }
    }
}

/// Per-phase stop conditions.
#[derive(Debug, Clone, Default)]
pub struct PhaseLimits {
    /// Stop after this many confirmed successes
    pub budget: Option<u64>,
    /// Shared countdown of successes still required by the phase
    pub remaining: Option<Arc<AtomicI64>>,
}

impl PhaseLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn warmup(budget: u64, remaining: Arc<AtomicI64>) -> Self {
        Self {
            budget: Some(budget),
            remaining: Some(remaining),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderStats {
    pub succeeded: u64,
    pub failed: u64,
    pub attempts: u64,
    /// Dequeued but abandoned because the run was cancelled
    pub interrupted: u64,
}

impl SenderStats {
    pub fn terminated(&self) -> u64 {
        self.succeeded + self.failed
    }
}

impl std::ops::AddAssign for SenderStats {
    fn add_assign(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.attempts += other.attempts;
        self.interrupted += other.interrupted;
    }
}

/// Result of a single send attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Ok { sent_at_ms: i64, latency_ms: i64 },
    Rejected(String),
    Timeout,
    Failed(ConnectionError),
    Interrupted,
}

/// Terminal state of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Exhausted,
    Interrupted,
}

enum Dequeued {
    Message(ChatMessage),
    Idle,
    Drained,
    Cancelled,
}

/// Worker: pulls messages off the queue and delivers each over its own connection.
pub struct Sender {
    id: usize,
    room: u32,
    queue: async_channel::Receiver<ChatMessage>,
    connections: ConnectionManager,
    metrics: Arc<Metrics>,
    settings: SenderSettings,
    limits: PhaseLimits,
    cancel: CancellationToken,
    /// A lost connection has not been replaced yet
    replacing: AtomicBool,
}

impl Sender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        room: u32,
        queue: async_channel::Receiver<ChatMessage>,
        connections: ConnectionManager,
        metrics: Arc<Metrics>,
        settings: SenderSettings,
        limits: PhaseLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            room,
            queue,
            connections,
            metrics,
            settings,
            limits,
            cancel,
            replacing: AtomicBool::new(false),
        }
    }

    pub async fn run(self) -> SenderStats {
        let mut stats = SenderStats::default();
        let mut conn: Option<Box<dyn Connection>> = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return stats,
            opened = self.connections.open(self.room) => match opened {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!("Sender {}: initial connect failed, retrying per message: {}", self.id, e);
                    None
                }
            },
        };

        while self.should_continue(&stats) {
            let msg = match self.dequeue().await {
                Dequeued::Message(msg) => msg,
                Dequeued::Idle => continue,
                Dequeued::Drained | Dequeued::Cancelled => break,
            };

            match self.send_with_retry(&mut conn, &msg, &mut stats).await {
                SendOutcome::Delivered => stats.succeeded += 1,
                SendOutcome::Exhausted => stats.failed += 1,
                SendOutcome::Interrupted => {
                    stats.interrupted += 1;
                    break;
                }
            }
        }

        if let Some(mut conn) = conn.take() {
            conn.close().await;
        }
        debug!(
            "Sender {} done: {} ok, {} failed, {} attempts",
            self.id, stats.succeeded, stats.failed, stats.attempts
        );
        stats
    }

    fn should_continue(&self, stats: &SenderStats) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if let Some(budget) = self.limits.budget {
            if stats.succeeded >= budget {
                return false;
            }
        }
        if let Some(remaining) = &self.limits.remaining {
            if remaining.load(Ordering::SeqCst) <= 0 {
                return false;
            }
        }
        true
    }

    async fn dequeue(&self) -> Dequeued {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Dequeued::Cancelled,
            polled = tokio::time::timeout(self.settings.dequeue_timeout, self.queue.recv()) => match polled {
                Ok(Ok(msg)) => Dequeued::Message(msg),
                // closed and empty
                Ok(Err(_)) => Dequeued::Drained,
                Err(_) if self.queue.is_closed() && self.queue.is_empty() => Dequeued::Drained,
                Err(_) => Dequeued::Idle,
            },
        }
    }

    /// Deliver `msg` with up to `max_retries` retries, recording exactly one terminal outcome.
    pub async fn send_with_retry(
        &self,
        conn: &mut Option<Box<dyn Connection>>,
        msg: &ChatMessage,
        stats: &mut SenderStats,
    ) -> SendOutcome {
        let retry = &self.settings.retry;
        let payload = match msg.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Sender {}: failed to encode message: {}", self.id, e);
                self.record_failure(msg);
                return SendOutcome::Exhausted;
            }
        };

        for attempt in 0..=retry.max_retries {
            stats.attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => AttemptOutcome::Interrupted,
                outcome = self.attempt(conn, &payload) => outcome,
            };

            match outcome {
                AttemptOutcome::Ok { sent_at_ms, latency_ms } => {
                    self.metrics.record_outcome(LatencyRecord::success(
                        sent_at_ms,
                        msg.message_type,
                        latency_ms,
                        msg.room,
                    ));
                    if let Some(remaining) = &self.limits.remaining {
                        remaining.fetch_sub(1, Ordering::SeqCst);
                    }
                    return SendOutcome::Delivered;
                }
                AttemptOutcome::Rejected(reason) => {
                    warn!("Sender {}: server error on attempt {}: {}", self.id, attempt + 1, reason)
                }
                AttemptOutcome::Timeout => {
                    debug!("Sender {}: no reply on attempt {}", self.id, attempt + 1)
                }
                AttemptOutcome::Failed(e) => {
                    debug!("Sender {}: attempt {} failed: {}", self.id, attempt + 1, e)
                }
                AttemptOutcome::Interrupted => return SendOutcome::Interrupted,
            }

            if let Some(delay) = retry.backoff_after(attempt) {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return SendOutcome::Interrupted,
                    _ = sleep(delay) => {}
                }
            }
        }

        self.record_failure(msg);
        SendOutcome::Exhausted
    }

    async fn attempt(&self, conn: &mut Option<Box<dyn Connection>>, payload: &str) -> AttemptOutcome {
        if conn.as_ref().map_or(true, |c| !c.is_open()) {
            let fresh = match conn.take() {
                Some(old) => {
                    self.replacing.store(true, Ordering::Relaxed);
                    self.connections.reconnect(old).await
                }
                None if self.replacing.load(Ordering::Relaxed) => self.connections.reopen(self.room).await,
                None => self.connections.open(self.room).await,
            };
            match fresh {
                Ok(fresh) => {
                    self.replacing.store(false, Ordering::Relaxed);
                    *conn = Some(fresh);
                }
                Err(e) => return AttemptOutcome::Failed(e),
            }
        }
        let c = match conn.as_mut() {
            Some(c) => c,
            None => return AttemptOutcome::Failed(ConnectionError::Closed),
        };

        let sent_at_ms = Utc::now().timestamp_millis();
        let started = Instant::now();
        match c.send_and_wait(payload, self.settings.response_timeout).await {
            Ok(Some(reply)) => match serde_json::from_str::<ChatResponse>(&reply) {
                Ok(response) if response.is_ok() => AttemptOutcome::Ok {
                    sent_at_ms,
                    latency_ms: started.elapsed().as_millis() as i64,
                },
                Ok(response) => AttemptOutcome::Rejected(response.reason().to_string()),
                Err(_) => AttemptOutcome::Rejected(format!("unparseable reply: {reply}")),
            },
            Ok(None) => AttemptOutcome::Timeout,
            Err(e) => AttemptOutcome::Failed(e),
        }
    }

    fn record_failure(&self, msg: &ChatMessage) {
        self.metrics.record_outcome(LatencyRecord::failure(
            Utc::now().timestamp_millis(),
            msg.message_type,
            msg.room,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsDetail;
    use crate::message::MessageType;
    use crate::metrics::{RecordStatus, FAILURE_SENTINEL_MS};
    use crate::mock::{MockBehavior, MockConnector};

    struct Harness {
        connector: Arc<MockConnector>,
        metrics: Arc<Metrics>,
        tx: async_channel::Sender<ChatMessage>,
        rx: async_channel::Receiver<ChatMessage>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new(connector: MockConnector) -> Self {
            let (tx, rx) = async_channel::bounded(64);
            Self {
                connector: Arc::new(connector),
                metrics: Arc::new(Metrics::new(MetricsDetail::Full)),
                tx,
                rx,
                cancel: CancellationToken::new(),
            }
        }

        fn sender(&self, limits: PhaseLimits) -> Sender {
            let connections = ConnectionManager::new(
                self.connector.clone(),
                self.metrics.clone(),
                Duration::from_secs(10),
            );
            let settings = SenderSettings {
                retry: RetryConfig::default(),
                response_timeout: Duration::from_millis(5_000),
                dequeue_timeout: Duration::from_millis(2_000),
            };
            Sender::new(
                0,
                1,
                self.rx.clone(),
                connections,
                self.metrics.clone(),
                settings,
                limits,
                self.cancel.clone(),
            )
        }
    }

    fn message(room: u32) -> ChatMessage {
        ChatMessage::new(77, "Load test passed!", MessageType::Text, room)
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_endpoint_exhausts_retries() {
        let h = Harness::new(MockConnector::new(MockBehavior::AlwaysError));
        let sender = h.sender(PhaseLimits::unlimited());
        let mut conn = Some(h.connections_open().await);
        let mut stats = SenderStats::default();

        let start = tokio::time::Instant::now();
        let outcome = sender.send_with_retry(&mut conn, &message(4), &mut stats).await;
        let elapsed = start.elapsed();

        assert_eq!(outcome, SendOutcome::Exhausted);
        assert_eq!(stats.attempts, 6);
        assert_eq!(h.connector.sends(), 6);
        assert!(elapsed >= Duration::from_millis(310), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(320), "{elapsed:?}");

        assert_eq!(h.metrics.fail_count(), 1);
        assert_eq!(h.metrics.success_count(), 0);
        let records = h.metrics.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].latency_ms, FAILURE_SENTINEL_MS);
        assert_eq!(records[0].status, RecordStatus::Fail);
        assert_eq!(records[0].room, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let error = serde_json::to_string(&ChatResponse::error("busy")).unwrap();
        let h = Harness::new(MockConnector::new(MockBehavior::Scripted(vec![
            Some(error.clone()),
            Some(error),
        ])));
        let sender = h.sender(PhaseLimits::unlimited());
        let mut conn = Some(h.connections_open().await);
        let mut stats = SenderStats::default();

        let start = tokio::time::Instant::now();
        let outcome = sender.send_with_retry(&mut conn, &message(2), &mut stats).await;

        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(stats.attempts, 3);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(h.metrics.success_count(), 1);
        assert_eq!(h.metrics.fail_count(), 0);
        assert_eq!(h.metrics.records()[0].status, RecordStatus::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried() {
        let h = Harness::new(MockConnector::new(MockBehavior::Scripted(vec![None])));
        let sender = h.sender(PhaseLimits::unlimited());
        let mut conn = Some(h.connections_open().await);
        let mut stats = SenderStats::default();

        let outcome = sender.send_with_retry(&mut conn, &message(1), &mut stats).await;
        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(stats.attempts, 2);
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let h = Harness::new(MockConnector::new(MockBehavior::DisconnectEvery(2)));
        let sender = h.sender(PhaseLimits::unlimited());
        let mut conn = Some(h.connections_open().await);
        let mut stats = SenderStats::default();

        // second send hits the disconnect and is resent on a fresh connection
        for _ in 0..2 {
            assert_eq!(
                sender.send_with_retry(&mut conn, &message(1), &mut stats).await,
                SendOutcome::Delivered
            );
        }
        assert_eq!(h.metrics.success_count(), 2);
        assert_eq!(stats.attempts, 3);
        assert_eq!(h.metrics.reconnection_count(), 1);
        assert_eq!(h.metrics.connection_count(), 2);
        assert!(conn.as_ref().unwrap().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_counted_after_failed_replacement() {
        let h = Harness::new(MockConnector::new(MockBehavior::DisconnectEvery(2)));
        let sender = h.sender(PhaseLimits::unlimited());
        let mut conn = Some(h.connections_open().await);
        let mut stats = SenderStats::default();

        assert_eq!(
            sender.send_with_retry(&mut conn, &message(1), &mut stats).await,
            SendOutcome::Delivered
        );

        // drop, failed reconnect, then a fresh handshake on the third attempt
        h.connector.fail_next_connects(1);
        assert_eq!(
            sender.send_with_retry(&mut conn, &message(1), &mut stats).await,
            SendOutcome::Delivered
        );
        assert_eq!(stats.attempts, 4);
        assert_eq!(h.metrics.connection_count(), 2);
        assert_eq!(h.metrics.reconnection_count(), 1);

        // the next send hits the following disconnect
        assert_eq!(
            sender.send_with_retry(&mut conn, &message(1), &mut stats).await,
            SendOutcome::Delivered
        );
        assert_eq!(h.metrics.reconnection_count(), 2);
        assert_eq!(h.metrics.connection_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_is_not_a_reconnection() {
        let h = Harness::new(MockConnector::new(MockBehavior::AlwaysOk).with_connect_failures(1));
        let sender = h.sender(PhaseLimits::unlimited());
        let mut conn = None;
        let mut stats = SenderStats::default();

        sender.send_with_retry(&mut conn, &message(1), &mut stats).await;
        assert_eq!(h.metrics.connection_count(), 1);
        assert_eq!(h.metrics.reconnection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handshake_uses_retry_budget() {
        let h = Harness::new(MockConnector::new(MockBehavior::AlwaysOk).with_connect_failures(2));
        let sender = h.sender(PhaseLimits::unlimited());
        let mut conn = None;
        let mut stats = SenderStats::default();

        let outcome = sender.send_with_retry(&mut conn, &message(1), &mut stats).await;
        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(stats.attempts, 3);
        assert_eq!(h.connector.sends(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_closes() {
        let h = Harness::new(MockConnector::new(MockBehavior::AlwaysOk));
        for room in 1..=20 {
            h.tx.send(message(room)).await.unwrap();
        }
        h.tx.close();

        let stats = h.sender(PhaseLimits::unlimited()).run().await;
        assert_eq!(stats.succeeded, 20);
        assert_eq!(stats.terminated(), 20);
        assert_eq!(h.metrics.success_count(), 20);
        assert_eq!(h.connector.closes(), 1);
        assert!(h.rx.is_empty());
    }

    #[tokio::test]
    async fn test_budget_and_shared_counter_stop_worker() {
        let h = Harness::new(MockConnector::new(MockBehavior::AlwaysOk));
        for _ in 0..30 {
            h.tx.send(message(1)).await.unwrap();
        }

        let stats = h.sender(PhaseLimits::warmup(10, Arc::new(AtomicI64::new(100)))).run().await;
        assert_eq!(stats.succeeded, 10);

        let remaining = Arc::new(AtomicI64::new(5));
        let stats = h.sender(PhaseLimits::warmup(100, remaining.clone())).run().await;
        assert_eq!(stats.succeeded, 5);
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
        assert_eq!(h.rx.len(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unwinds_without_failure() {
        let h = Harness::new(MockConnector::new(MockBehavior::NeverRespond));
        h.tx.send(message(1)).await.unwrap();

        let handle = tokio::spawn(h.sender(PhaseLimits::unlimited()).run());
        sleep(Duration::from_millis(1_000)).await;
        h.cancel.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats.interrupted, 1);
        assert_eq!(stats.terminated(), 0);
        assert_eq!(h.metrics.fail_count(), 0);
        assert_eq!(h.metrics.record_count(), 0);
        assert_eq!(h.connector.closes(), 1);
    }

    impl Harness {
        async fn connections_open(&self) -> Box<dyn Connection> {
            ConnectionManager::new(self.connector.clone(), self.metrics.clone(), Duration::from_secs(10))
                .open(1)
                .await
                .unwrap()
        }
    }
}
