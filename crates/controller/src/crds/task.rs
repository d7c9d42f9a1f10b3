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

//! `Task` Custom Resource Definition

use super::context::{ContextItem, OutputSpec};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation that asks the controller to stop a Task
pub const STOP_ANNOTATION: &str = "agents.platform/stop";

/// Reference to an `Agent`, optionally in another namespace
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct AgentReference {
    pub name: String,

    /// Defaults to the referencing object's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference to a `TaskTemplate`, optionally in another namespace
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct TemplateReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// `Task` CRD: one request to execute a unit of work under an `Agent`
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "agents.platform", version = "v1alpha1", kind = "Task")]
#[kube(namespaced)]
#[kube(status = "TaskStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".status.agentRef.name"}"#)]
#[kube(printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".status.podName"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Primary instructions; written first into the aggregate task file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Agent to run under; overrides the template's reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<AgentReference>,

    /// Template supplying default agent, contexts and outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_template_ref: Option<TemplateReference>,

    #[serde(default)]
    pub contexts: Vec<ContextItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<OutputSpec>,
}

/// Lifecycle phase of a `Task`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum TaskPhase {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Completed => "Completed",
        };
        f.write_str(s)
    }
}

/// Agent reference as resolved at admission time; frozen once recorded
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub struct ResolvedAgentRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResolvedAgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Status of the `Task`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TaskPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<ResolvedAgentRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_namespace: Option<String>,

    /// RFC3339 timestamp of admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// RFC3339 timestamp of the terminal transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    #[serde(default)]
    pub conditions: Vec<TaskCondition>,

    /// Collected output parameter values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Condition for the `Task`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True or False)
    pub status: String,

    /// Machine-readable reason code
    pub reason: String,

    /// Human-readable message about the condition
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl TaskStatus {
    /// Look up a condition by type
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&TaskCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Insert or replace a condition, keeping the transition time when the status is unchanged
    pub fn set_condition(&mut self, mut condition: TaskCondition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }
}

impl Task {
    /// Current phase, treating a missing status as `Pending`
    #[must_use]
    pub fn phase(&self) -> TaskPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    /// Whether the stop annotation is set to a truthy value
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.annotations()
            .get(STOP_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Frozen agent reference, if admission ever resolved one
    #[must_use]
    pub fn resolved_agent(&self) -> Option<&ResolvedAgentRef> {
        self.status.as_ref().and_then(|s| s.agent_ref.as_ref())
    }

    #[must_use]
    pub fn start_time(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.start_time.as_deref())
    }
}
