use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub load: LoadConfig,
    pub warmup: WarmupConfig,
    pub main: MainConfig,
    pub retry: RetryConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.target.url.trim().is_empty() {
            anyhow::bail!("target.url must not be empty");
        }
        if self.target.rooms == 0 {
            anyhow::bail!("target.rooms must be at least 1");
        }
        if self.load.queue_capacity == 0 {
            anyhow::bail!("load.queue_capacity must be at least 1");
        }
        if self.warmup.workers == 0 || self.main.workers == 0 {
            anyhow::bail!("warmup.workers and main.workers must be at least 1");
        }
        if self.target.connect_timeout_ms == 0 || self.target.response_timeout_ms == 0 {
            anyhow::bail!("target.connect_timeout_ms and target.response_timeout_ms must be at least 1");
        }
        if self.load.dequeue_timeout_ms == 0 {
            anyhow::bail!("load.dequeue_timeout_ms must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Base WebSocket URL; connections go to `{url}/chat/{room}`
    pub url: String,
    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-attempt response timeout in milliseconds
    pub response_timeout_ms: u64,
    /// Number of logical rooms (1..=rooms)
    pub rooms: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            connect_timeout_ms: 10_000,
            response_timeout_ms: 5_000,
            rooms: 20,
        }
    }
}

impl TargetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Total messages produced by the generator
    pub total_messages: u64,
    /// Capacity of the bounded hand-off queue
    pub queue_capacity: usize,
    /// How long a worker waits on an empty queue before re-checking
    pub dequeue_timeout_ms: u64,
    /// Delay between starting the generator and starting the first phase
    pub generator_head_start_ms: u64,
    /// Optional seed for reproducible message generation
    pub seed: Option<u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            total_messages: 500_000,
            queue_capacity: 10_000,
            dequeue_timeout_ms: 2_000,
            generator_head_start_ms: 500,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub workers: usize,
    /// Per-worker quota; the phase requires `workers * messages_per_worker` successes
    pub messages_per_worker: u64,
    pub join_timeout_secs: u64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            workers: 32,
            messages_per_worker: 1_000,
            join_timeout_secs: 600,
        }
    }
}

impl WarmupConfig {
    pub fn required_successes(&self) -> u64 {
        self.workers as u64 * self.messages_per_worker
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MainConfig {
    pub workers: usize,
    pub join_timeout_secs: u64,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            workers: 512,
            join_timeout_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (attempts = max_retries + 1)
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_base_ms * 2^n`
    pub backoff_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 10,
        }
    }
}

impl RetryConfig {
    /// Sleep after a failed `attempt` (0-based). `None` after the final attempt.
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Some(Duration::from_millis(
            self.backoff_base_ms.saturating_mul(factor),
        ))
    }

    pub fn total_backoff(&self) -> Duration {
        (0..=self.max_retries)
            .filter_map(|attempt| self.backoff_after(attempt))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsDetail {
    /// Counters only
    Summary,
    /// Counters plus one latency record per terminal outcome
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentilePolicy {
    /// Sort every stored latency, including the -1 failure sentinel
    IncludeFailures,
    /// Drop FAIL records before sorting
    ExcludeFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub detail: MetricsDetail,
    pub percentiles: PercentilePolicy,
    /// Directory for CSV exports and the JSON run summary
    pub dir: String,
    pub progress_interval_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            detail: MetricsDetail::Full,
            percentiles: PercentilePolicy::IncludeFailures,
            dir: "results".to_string(),
            progress_interval_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[target]
url = "ws://localhost:9090"
response_timeout_ms = 2500

[load]
total_messages = 1000
queue_capacity = 10
seed = 7

[warmup]
workers = 4
messages_per_worker = 25

[main]
workers = 64

[output]
detail = "summary"
percentiles = "exclude_failures"
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.target.url, "ws://localhost:9090");
        assert_eq!(config.target.response_timeout_ms, 2500);
        assert_eq!(config.target.connect_timeout_ms, 10_000);
        assert_eq!(config.load.total_messages, 1000);
        assert_eq!(config.load.seed, Some(7));
        assert_eq!(config.warmup.required_successes(), 100);
        assert_eq!(config.main.workers, 64);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.output.detail, MetricsDetail::Summary);
        assert_eq!(config.output.percentiles, PercentilePolicy::ExcludeFailures);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_file_is_default_profile() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.load.total_messages, 500_000);
        assert_eq!(config.load.queue_capacity, 10_000);
        assert_eq!(config.warmup.required_successes(), 32_000);
        assert_eq!(config.main.workers, 512);
        assert_eq!(config.output.detail, MetricsDetail::Full);
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryConfig::default();
        let delays: Vec<u64> = (0..=retry.max_retries)
            .map(|a| retry.backoff_after(a).map(|d| d.as_millis() as u64).unwrap_or(0))
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 0]);
        assert_eq!(retry.total_backoff(), Duration::from_millis(310));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.main.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.target.response_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.target.connect_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.load.dequeue_timeout_ms = 0;
        assert!(config.validate().is_err());

        let parsed: Config = toml::from_str("[target]\nresponse_timeout_ms = 0\n").unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/example.local.toml");
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.target.url, "ws://127.0.0.1:8080");
        assert_eq!(config.warmup.required_successes(), 32_000);
        assert_eq!(config.retry.total_backoff(), Duration::from_millis(310));
    }
}
