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

//! Shared fixtures for reconciler integration tests

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use task_controller::crds::{
    AgentReference, AgentSpec, ContextItem, ContextSource, Task, TaskPhase, TaskSpec, TaskStatus,
};
use task_controller::tasks::admission::ManualClock;
use task_controller::tasks::memory::MemoryBackend;
use task_controller::tasks::reconcile::Outcome;
use task_controller::tasks::types::TaskKey;
use task_controller::tasks::{Context, ControllerConfig, Reconciler};

pub struct Harness {
    pub backend: MemoryBackend,
    pub clock: Arc<ManualClock>,
    pub reconciler: Reconciler<MemoryBackend, Arc<ManualClock>>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let backend = MemoryBackend::with_clock(clock.clone());
        let context = Arc::new(Context {
            backend: backend.clone(),
            clock: Arc::clone(&clock),
            config: Arc::new(ControllerConfig::default()),
        });
        Self {
            backend,
            clock,
            reconciler: Reconciler::new(context),
        }
    }

    pub async fn reconcile(&self, key: &TaskKey) -> Outcome {
        self.reconciler.reconcile(key).await.unwrap()
    }

    pub fn status(&self, key: &TaskKey) -> TaskStatus {
        self.backend.status(key).unwrap_or_default()
    }

    pub fn phase(&self, key: &TaskKey) -> TaskPhase {
        self.status(key).phase.unwrap_or_default()
    }

    pub fn condition_reason(&self, key: &TaskKey, condition: &str) -> Option<String> {
        self.status(key).condition(condition).map(|c| c.reason.clone())
    }

    pub fn condition_status(&self, key: &TaskKey, condition: &str) -> Option<String> {
        self.status(key).condition(condition).map(|c| c.status.clone())
    }
}

pub fn agent(max_concurrent: Option<i32>) -> AgentSpec {
    AgentSpec {
        service_account_name: "agent-runner".to_string(),
        max_concurrent_tasks: max_concurrent,
        ..Default::default()
    }
}

pub fn task(namespace: &str, name: &str, agent_name: &str) -> Task {
    let mut task = Task::new(
        name,
        TaskSpec {
            description: Some(format!("Do {name}")),
            agent_ref: Some(AgentReference {
                name: agent_name.to_string(),
                namespace: None,
            }),
            ..Default::default()
        },
    );
    task.metadata.namespace = Some(namespace.to_string());
    task
}

pub fn text_context(name: &str, text: &str) -> ContextItem {
    ContextItem {
        name: Some(name.to_string()),
        description: None,
        mount_path: None,
        file_mode: None,
        source: ContextSource::Text {
            text: text.to_string(),
        },
    }
}
