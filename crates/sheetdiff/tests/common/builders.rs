//! Builders for test configurations.

#![allow(dead_code)]

use sheetdiff::config::{Config, PipelineMode, RetryConfig, WorkersConfig};

/// Builder for `Config` with retries short enough for tests.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.retry = RetryConfig {
            max_retries: 3,
            base_delay_ms: 5,
            max_delay_ms: 20,
        };
        config.workers = WorkersConfig {
            ocr_concurrency: 2,
            diff_concurrency: 1,
            summary_concurrency: 2,
        };
        Self { config }
    }

    pub fn mode(mut self, mode: PipelineMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn ocr_concurrency(mut self, n: usize) -> Self {
        self.config.workers.ocr_concurrency = n;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
