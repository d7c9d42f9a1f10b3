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

//! `Agent` Custom Resource Definition: a reusable execution profile

use super::context::ContextItem;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_workspace_dir() -> String {
    "/workspace".to_string()
}

/// Sliding-window limit on how many Tasks may start
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    /// Maximum Task starts inside the window
    pub max_task_starts: i32,

    /// Window length in seconds
    pub window_seconds: i64,
}

/// Reference to a Kubernetes secret, optionally to a single key
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Secret delivered to the worker container
///
/// With a `key`, exactly one of `env` or `mountPath` must be set. Without a key
/// the whole secret is exposed, as environment variables or as a directory.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub name: String,

    pub secret_ref: SecretReference,

    /// Environment variable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    /// File (or directory) path inside the worker container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    /// File mode for mounted secrets; defaults to 0600
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<i32>,
}

/// Low-level placement hints copied onto the workload
///
/// Scheduling fields are kept as raw JSON and validated when the pod is built.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentPodSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Isolation class (e.g. gvisor, kata)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,

    /// Worker container resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
}

/// `Agent` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1alpha1", kind = "Agent")]
#[kube(namespaced)]
#[kube(printcolumn = r#"{"name":"Max","type":"integer","jsonPath":".spec.maxConcurrentTasks"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Tool payload image for the init container. Older agents used this
    /// single field for the worker image; see `resolve_images`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image: Option<String>,

    /// Worker container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_image: Option<String>,

    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,

    /// Worker command; the default runs the staged tool against the task file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    pub service_account_name: String,

    #[serde(default)]
    pub contexts: Vec<ContextItem>,

    #[serde(default)]
    pub credentials: Vec<Credential>,

    /// Running Task cap; absent or non-positive means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaConfig>,

    /// Glob patterns for namespaces allowed to reference this Agent; empty allows all
    #[serde(default)]
    pub allowed_namespaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_spec: Option<AgentPodSpec>,

    /// Inline JSON configuration handed to the agent tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl AgentSpec {
    /// Concurrency cap, if one applies
    #[must_use]
    pub fn concurrency_limit(&self) -> Option<usize> {
        self.max_concurrent_tasks
            .filter(|max| *max > 0)
            .and_then(|max| usize::try_from(max).ok())
    }
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            agent_image: None,
            executor_image: None,
            workspace_dir: default_workspace_dir(),
            command: None,
            service_account_name: String::new(),
            contexts: Vec::new(),
            credentials: Vec::new(),
            max_concurrent_tasks: None,
            quota: None,
            allowed_namespaces: Vec::new(),
            pod_spec: None,
            config: None,
        }
    }
}
