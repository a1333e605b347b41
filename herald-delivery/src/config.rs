use std::time::Duration;

use serde::Deserialize;

const fn default_max_tries() -> u32 {
    2
}

const fn default_retry_delay_secs() -> u64 {
    4
}

const fn default_inter_task_delay_secs() -> u64 {
    0
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Delivery attempts permitted before a recipient is abandoned for
    /// this run.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Wait before re-attempting a failed task (in seconds).
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Wait after completing one task before admitting the next (in
    /// seconds). Used to respect transport rate limits.
    #[serde(default = "default_inter_task_delay_secs")]
    pub inter_task_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            retry_delay_secs: default_retry_delay_secs(),
            inter_task_delay_secs: default_inter_task_delay_secs(),
        }
    }
}

impl QueueConfig {
    /// The retry delay as a [`Duration`].
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// The inter-task delay as a [`Duration`].
    #[must_use]
    pub const fn inter_task_delay(&self) -> Duration {
        Duration::from_secs(self.inter_task_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_tries, 2);
        assert_eq!(config.retry_delay(), Duration::from_secs(4));
        assert_eq!(config.inter_task_delay(), Duration::ZERO);
    }
}
