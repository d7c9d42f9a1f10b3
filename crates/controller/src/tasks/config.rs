/*
 * 5D Labs Agent Platform - Task Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Task Controller Configuration
//!
//! Loaded from a mounted YAML file. Every section has defaults so a partial
//! (or missing) file still yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ControllerConfig {
    /// Default images used when an Agent does not specify its own
    #[serde(default)]
    pub images: ImageConfig,

    /// Queue and requeue timing
    #[serde(default)]
    pub queue: QueueConfig,

    /// Reconcile worker pool
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Backoff for transient backend failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Stop handling
    #[serde(default)]
    pub stop: StopConfig,

    /// Which namespaces to watch
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Tool payload image for the init container
    #[serde(default = "default_agent_image")]
    pub agent_image: String,

    /// Worker image
    #[serde(default = "default_executor_image")]
    pub executor_image: String,

    /// Image carrying `task-tools` (context-init, git-init, url-fetch, collect-outputs)
    #[serde(default = "default_system_image")]
    pub system_image: String,

    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Re-evaluation delay for Tasks waiting on concurrency
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay_seconds: u64,

    /// Poll interval for Tasks whose workload is running
    #[serde(default = "default_running_poll")]
    pub running_poll_seconds: u64,

    /// Full resync of every Task
    #[serde(default = "default_resync_interval")]
    pub resync_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopConfig {
    /// Grace period handed to the substrate when deleting a stopped workload
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Restrict the controller to one namespace; all namespaces when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn default_agent_image() -> String {
    "ghcr.io/5dlabs/agent-tools:latest".to_string()
}

fn default_executor_image() -> String {
    "ghcr.io/5dlabs/agent-devbox:latest".to_string()
}

fn default_system_image() -> String {
    "ghcr.io/5dlabs/task-tools:latest".to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_requeue_delay() -> u64 {
    10
}

fn default_running_poll() -> u64 {
    30
}

fn default_resync_interval() -> u64 {
    300
}

fn default_max_concurrent_reconciles() -> usize {
    8
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_seconds() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    8
}

fn default_grace_period() -> u32 {
    30
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            agent_image: default_agent_image(),
            executor_image: default_executor_image(),
            system_image: default_system_image(),
            image_pull_policy: default_pull_policy(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            requeue_delay_seconds: default_requeue_delay(),
            running_poll_seconds: default_running_poll(),
            resync_interval_seconds: default_resync_interval(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_seconds: default_max_delay_seconds(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given (1-based) attempt, capped at `max_delay_seconds`
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(Duration::from_secs(self.max_delay_seconds))
    }
}

impl ControllerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        for (field, value) in [
            ("images.agentImage", &self.images.agent_image),
            ("images.executorImage", &self.images.executor_image),
            ("images.systemImage", &self.images.system_image),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow::anyhow!("{field} must not be empty"));
            }
        }

        if self.workers.max_concurrent_reconciles == 0 {
            return Err(anyhow::anyhow!(
                "workers.maxConcurrentReconciles must be at least 1"
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.maxAttempts must be at least 1"));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_seconds.saturating_mul(1000) {
            return Err(anyhow::anyhow!(
                "retry.baseDelayMs ({}) exceeds retry.maxDelaySeconds ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_seconds
            ));
        }

        if self.queue.requeue_delay_seconds == 0 || self.queue.running_poll_seconds == 0 {
            return Err(anyhow::anyhow!(
                "queue.requeueDelaySeconds and queue.runningPollSeconds must be positive"
            ));
        }

        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }
}
