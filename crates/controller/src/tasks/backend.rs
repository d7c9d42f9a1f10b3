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

//! Seams between the reconciler and the outside world.
//!
//! The reconciler only talks to the declarative store and the workload
//! substrate through these traits. `KubeBackend` implements them against a
//! cluster, `MemoryBackend` in memory for tests.

use crate::crds::{Agent, ResolvedAgentRef, Task, TaskStatus, TaskTemplate};
use crate::tasks::types::{Result, TaskKey};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use std::collections::BTreeMap;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>>;

    /// Every Task the controller is responsible for
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Replace the status subresource
    async fn update_status(&self, key: &TaskKey, status: &TaskStatus) -> Result<()>;

    async fn add_finalizer(&self, key: &TaskKey, finalizer: &str) -> Result<()>;

    /// Removing an absent finalizer, or from a Task that is gone, succeeds
    async fn remove_finalizer(&self, key: &TaskKey, finalizer: &str) -> Result<()>;

    async fn add_labels(&self, key: &TaskKey, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Merge a single annotation into the Task metadata
    async fn annotate(&self, key: &TaskKey, annotation: &str, value: &str) -> Result<()>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get_agent(&self, namespace: &str, name: &str) -> Result<Option<Agent>>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, namespace: &str, name: &str) -> Result<Option<TaskTemplate>>;
}

/// Read access to `ConfigMap` contents referenced by context items
#[async_trait]
pub trait ConfigSourceReader: Send + Sync {
    async fn get_config_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;
}

/// Best-effort snapshot of Tasks referencing an Agent.
///
/// The view is eventually consistent and not locked against concurrent
/// writers, so admission bounds derived from it are soft.
#[async_trait]
pub trait SiblingLister: Send + Sync {
    async fn list_siblings(&self, agent: &ResolvedAgentRef) -> Result<Vec<Task>>;
}

/// Where workloads run
#[async_trait]
pub trait WorkloadSubstrate: Send + Sync {
    /// Creating a `ConfigMap` that already exists replaces it
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Creating a pod that already exists succeeds without changes
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Graceful delete; a pod that is already gone is not an error
    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: u32)
        -> Result<()>;

    /// A `ConfigMap` that is already gone is not an error
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Everything the reconciler needs
pub trait Backend:
    TaskStore + AgentStore + TemplateStore + ConfigSourceReader + SiblingLister + WorkloadSubstrate
{
}

impl<T> Backend for T where
    T: TaskStore
        + AgentStore
        + TemplateStore
        + ConfigSourceReader
        + SiblingLister
        + WorkloadSubstrate
{
}
