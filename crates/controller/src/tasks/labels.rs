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

//! Well-known labels, finalizers, condition types and reason codes

use crate::crds::TaskCondition;
use chrono::{DateTime, Utc};

pub const TASK_FINALIZER: &str = "agents.platform/task-cleanup";

/// Set on Tasks once their agent is resolved; used to select siblings
pub const AGENT_LABEL: &str = "agents.platform/agent";
pub const AGENT_NAMESPACE_LABEL: &str = "agents.platform/agent-namespace";

/// Set on workloads
pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "task-controller";
pub const TASK_LABEL: &str = "agents.platform/task";
pub const TASK_NAMESPACE_LABEL: &str = "agents.platform/task-namespace";

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_QUEUED: &str = "Queued";
pub const CONDITION_SUCCEEDED: &str = "Succeeded";
pub const CONDITION_STOPPED: &str = "Stopped";

pub const REASON_AGENT_ERROR: &str = "AgentError";
pub const REASON_TEMPLATE_ERROR: &str = "TaskTemplateError";
pub const REASON_CONTEXT_ERROR: &str = "ContextError";
pub const REASON_CREDENTIAL_ERROR: &str = "CredentialError";
pub const REASON_BACKEND_UNAVAILABLE: &str = "BackendUnavailable";
pub const REASON_AT_CAPACITY: &str = "AgentAtCapacity";
pub const REASON_QUOTA_EXCEEDED: &str = "QuotaExceeded";
pub const REASON_CAPACITY_AVAILABLE: &str = "CapacityAvailable";
pub const REASON_WORKLOAD_CREATED: &str = "WorkloadCreated";
pub const REASON_SUCCEEDED: &str = "Succeeded";
pub const REASON_FAILED: &str = "Failed";
pub const REASON_EVICTED: &str = "Evicted";
pub const REASON_WORKLOAD_LOST: &str = "WorkloadLost";
pub const REASON_USER_STOPPED: &str = "UserStopped";

/// Build a condition stamped with `now`
#[must_use]
pub fn condition(
    condition_type: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> TaskCondition {
    TaskCondition {
        condition_type: condition_type.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Some(now.to_rfc3339()),
    }
}

/// Label values may not contain `/`; keep the namespace separate
#[must_use]
pub fn agent_labels(namespace: &str, name: &str) -> [(String, String); 2] {
    [
        (AGENT_LABEL.to_string(), name.to_string()),
        (AGENT_NAMESPACE_LABEL.to_string(), namespace.to_string()),
    ]
}

/// Label selector matching Tasks labelled for the given agent
#[must_use]
pub fn agent_selector(namespace: &str, name: &str) -> String {
    format!("{AGENT_LABEL}={name},{AGENT_NAMESPACE_LABEL}={namespace}")
}
