use std::time::Duration;

/// Process-wide settings for an [`SqsState`](super::state::SqsState).
///
/// Per-queue policy (visibility timeout, size limits, redrive) lives in the
/// queue attributes instead.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub account_id: String,
    pub region: String,
    pub base_url: String,
    /// Upper bound on how long a long-poll receive sleeps between checks.
    pub long_poll_step: Duration,
    pub dedup_window: Duration,
    pub sweep_interval: Duration,
}

impl EngineConfig {
    pub fn new(account_id: String, region: String, port: u16) -> Self {
        EngineConfig {
            account_id,
            region,
            base_url: format!("http://localhost:{}", port),
            ..Default::default()
        }
    }

    pub fn queue_url(&self, name: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.account_id, name)
    }

    pub fn queue_arn(&self, name: &str) -> String {
        format!("arn:aws:sqs:{}:{}:{}", self.region, self.account_id, name)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            account_id: "000000000000".into(),
            region: "us-east-1".into(),
            base_url: "http://localhost:9324".into(),
            long_poll_step: Duration::from_millis(100),
            dedup_window: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
        }
    }
}
