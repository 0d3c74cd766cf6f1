//! Scheduler configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Repositories to watch.
    #[serde(default)]
    pub repos: Vec<String>,

    /// Failed or mishap attempts allowed per (repo, commit, task name)
    /// before the name is excluded at that commit.
    #[serde(default = "default_retry_bound")]
    pub retry_bound: u32,

    /// Seconds a running task may go without a terminal poll result
    /// before it is written off as a mishap.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Seconds an entity stays in the indexed caches after creation.
    #[serde(default = "default_cache_window_secs")]
    pub cache_window_secs: u64,

    /// Worker pool size for batch encode/decode. Consumed by the driver
    /// when it builds the store's codec; the scheduler itself receives
    /// the store ready-made.
    #[serde(default = "default_codec_workers")]
    pub codec_workers: usize,

    /// Seconds the driver sleeps between iterations that made no
    /// progress. Like `codec_workers`, driver-facing.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_retry_bound() -> u32 {
    3
}

fn default_task_timeout_secs() -> u64 {
    4 * 60 * 60
}

fn default_cache_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_codec_workers() -> usize {
    8
}

fn default_tick_secs() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            retry_bound: default_retry_bound(),
            task_timeout_secs: default_task_timeout_secs(),
            cache_window_secs: default_cache_window_secs(),
            codec_workers: default_codec_workers(),
            tick_secs: default_tick_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"repos": ["skia"]}"#).unwrap();
        assert_eq!(config.repos, vec!["skia".to_string()]);
        assert_eq!(config.retry_bound, 3);
        assert_eq!(config.task_timeout_secs, 4 * 60 * 60);
        assert_eq!(config.codec_workers, 8);
    }
}
