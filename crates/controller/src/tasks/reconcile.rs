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

//! Task state machine
//!
//! `Pending` and `Queued` Tasks are resolved and run through admission;
//! admitted Tasks get their workload created and move to `Running`; `Running`
//! Tasks are polled until the workload terminates. `Completed` is terminal.
//! Validation failures end the Task as `Completed` with `Ready=False`.

use crate::crds::{ResolvedAgentRef, Task, TaskPhase, TaskStatus, STOP_ANNOTATION};
use crate::tasks::admission::{admit, Clock, Decision, SiblingTask};
use crate::tasks::backend::{Backend, TaskStore};
use crate::tasks::contexts::{load_config_sources, merge_inputs, plan_contexts, ContextNamespaces};
use crate::tasks::labels::{
    agent_labels, condition, CONDITION_QUEUED, CONDITION_READY, CONDITION_STOPPED,
    CONDITION_SUCCEEDED, REASON_BACKEND_UNAVAILABLE, REASON_CAPACITY_AVAILABLE, REASON_EVICTED,
    REASON_FAILED, REASON_SUCCEEDED, REASON_USER_STOPPED, REASON_WORKLOAD_CREATED,
    REASON_WORKLOAD_LOST, TASK_FINALIZER,
};
use crate::tasks::naming::ResourceNaming;
use crate::tasks::queue::{requeue_delay, waiters};
use crate::tasks::resolve::{resolve, Resolution};
use crate::tasks::runtime::KeyLocks;
use crate::tasks::types::{Context, Error, Rejection, Result, TaskKey};
use crate::tasks::workload::{build_workload, WorkloadRequest, OUTPUT_COLLECTOR_CONTAINER};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// When the runtime should look at a Task again on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Only on the next change or resync
    AwaitChange,
    After(Duration),
}

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub requeue: Requeue,

    /// Set when this pass released a running slot of the agent; its waiters
    /// should be re-evaluated
    pub freed_agent: Option<ResolvedAgentRef>,

    /// The Task was denied admission and stays `Queued`
    pub waiting: bool,
}

impl Outcome {
    #[must_use]
    pub fn await_change() -> Self {
        Self {
            requeue: Requeue::AwaitChange,
            freed_agent: None,
            waiting: false,
        }
    }

    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: Requeue::After(delay),
            freed_agent: None,
            waiting: false,
        }
    }

    #[must_use]
    pub fn queued(retry_in: Duration) -> Self {
        Self {
            requeue: Requeue::After(retry_in),
            freed_agent: None,
            waiting: true,
        }
    }

    #[must_use]
    pub fn freeing(agent: Option<ResolvedAgentRef>) -> Self {
        Self {
            requeue: Requeue::AwaitChange,
            freed_agent: agent,
            waiting: false,
        }
    }
}

/// Terminal state of a workload, as far as the Task is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadState {
    Missing,
    Active,
    Succeeded,
    Failed(String),
    Evicted(String),
}

fn terminated_with_error(status: &ContainerStatus) -> Option<String> {
    let terminated = status.state.as_ref()?.terminated.as_ref()?;
    (terminated.exit_code != 0).then(|| {
        let mut message = format!(
            "container {} exited with code {}",
            status.name, terminated.exit_code
        );
        if let Some(reason) = terminated.reason.as_deref().filter(|r| !r.is_empty()) {
            message.push_str(&format!(" ({reason})"));
        }
        message
    })
}

/// Map a pod onto the Task lifecycle.
///
/// `restartPolicy: Never` means the pod phase is final once it is Succeeded
/// or Failed, including failures of init containers.
#[must_use]
pub fn workload_state(pod: Option<&Pod>) -> WorkloadState {
    let Some(pod) = pod else {
        return WorkloadState::Missing;
    };
    let Some(status) = pod.status.as_ref() else {
        return WorkloadState::Active;
    };

    if status.reason.as_deref() == Some("Evicted") {
        return WorkloadState::Evicted(
            status
                .message
                .clone()
                .unwrap_or_else(|| "Pod was evicted".to_string()),
        );
    }

    match status.phase.as_deref() {
        Some("Succeeded") => WorkloadState::Succeeded,
        Some("Failed") => {
            let message = status
                .init_container_statuses
                .iter()
                .chain(status.container_statuses.iter())
                .flatten()
                .find_map(terminated_with_error)
                .or_else(|| status.message.clone())
                .unwrap_or_else(|| "Pod failed".to_string());
            WorkloadState::Failed(message)
        }
        _ => WorkloadState::Active,
    }
}

#[derive(Deserialize)]
struct CollectedOutputs {
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

/// Output values written by the collector sidecar to its termination message
#[must_use]
pub fn collected_outputs(pod: &Pod) -> Option<BTreeMap<String, String>> {
    let message = pod
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == OUTPUT_COLLECTOR_CONTAINER)?
        .state
        .as_ref()?
        .terminated
        .as_ref()?
        .message
        .as_deref()?
        .trim();

    if message.is_empty() {
        return None;
    }

    match serde_json::from_str::<CollectedOutputs>(message) {
        Ok(outputs) => Some(outputs.parameters),
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable output collector message");
            None
        }
    }
}

/// Ask the controller to stop a Task. Used by the presentation layer.
pub async fn request_stop<S>(store: &S, key: &TaskKey) -> Result<()>
where
    S: TaskStore + ?Sized,
{
    info!(task = %key, "Requesting stop");
    store.annotate(key, STOP_ANNOTATION, "true").await
}

/// Record that the backend kept failing for this Task. The phase is untouched.
pub async fn mark_backend_unavailable<S>(
    store: &S,
    key: &TaskKey,
    message: &str,
    now: DateTime<Utc>,
) -> Result<()>
where
    S: TaskStore + ?Sized,
{
    let Some(task) = store.get_task(key).await? else {
        return Ok(());
    };
    let mut status = task.status.unwrap_or_default();
    status.set_condition(condition(
        CONDITION_READY,
        false,
        REASON_BACKEND_UNAVAILABLE,
        message,
        now,
    ));
    store.update_status(key, &status).await
}

pub struct Reconciler<B, C> {
    ctx: Arc<Context<B, C>>,

    /// Held from the sibling snapshot until the decision is written, so two
    /// Tasks of one agent never decide on the same snapshot in this process
    admissions: Arc<KeyLocks<ResolvedAgentRef>>,
}

impl<B, C> Clone for Reconciler<B, C> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            admissions: Arc::clone(&self.admissions),
        }
    }
}

impl<B: Backend, C: Clock> Reconciler<B, C> {
    #[must_use]
    pub fn new(ctx: Arc<Context<B, C>>) -> Self {
        Self {
            ctx,
            admissions: Arc::new(KeyLocks::default()),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Context<B, C> {
        &self.ctx
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    fn running_poll(&self) -> Duration {
        Duration::from_secs(self.ctx.config.queue.running_poll_seconds)
    }

    /// Queued Tasks of `agent`, oldest first
    pub async fn waiters(&self, agent: &ResolvedAgentRef) -> Result<Vec<TaskKey>> {
        let snapshot = self.sibling_snapshot(agent).await?;
        Ok(waiters(&snapshot))
    }

    async fn sibling_snapshot(&self, agent: &ResolvedAgentRef) -> Result<Vec<SiblingTask>> {
        let siblings = self.ctx.backend.list_siblings(agent).await?;
        Ok(siblings
            .iter()
            .filter_map(|t| SiblingTask::from_task(t, agent))
            .collect())
    }

    /// Drive one Task a step further
    #[instrument(skip_all, fields(task = %key))]
    pub async fn reconcile(&self, key: &TaskKey) -> Result<Outcome> {
        let Some(task) = self.ctx.backend.get_task(key).await? else {
            debug!("Task is gone");
            return Ok(Outcome::await_change());
        };

        if task.metadata.deletion_timestamp.is_some() {
            return self.cleanup(key, &task).await;
        }

        if !task.finalizers().iter().any(|f| f == TASK_FINALIZER) {
            self.ctx.backend.add_finalizer(key, TASK_FINALIZER).await?;
        }

        let phase = task.phase();
        if phase == TaskPhase::Completed {
            return Ok(Outcome::await_change());
        }

        if task.stop_requested() {
            return self.stop(key, &task).await;
        }

        match phase {
            TaskPhase::Pending | TaskPhase::Queued => match self.admit_or_queue(key, &task).await {
                Err(Error::Rejected(rejection)) => self.fail(key, &task, &rejection).await,
                other => other,
            },
            TaskPhase::Running => self.observe(key, &task).await,
            TaskPhase::Completed => Ok(Outcome::await_change()),
        }
    }

    fn base_status(task: &Task) -> TaskStatus {
        let mut status = task.status.clone().unwrap_or_default();
        status.observed_generation = task.metadata.generation;
        status
    }

    async fn write_status(&self, key: &TaskKey, task: &Task, status: &TaskStatus) -> Result<()> {
        if task.status.as_ref() == Some(status) {
            return Ok(());
        }
        self.ctx.backend.update_status(key, status).await
    }

    async fn fail(&self, key: &TaskKey, task: &Task, rejection: &Rejection) -> Result<Outcome> {
        warn!(reason = rejection.reason, message = %rejection.message, "❌ Task rejected");
        let now = self.now();
        let mut status = Self::base_status(task);
        status.phase = Some(TaskPhase::Completed);
        status.completion_time = Some(now.to_rfc3339());
        status.set_condition(condition(
            CONDITION_READY,
            false,
            rejection.reason,
            rejection.message.clone(),
            now,
        ));
        status.set_condition(condition(
            CONDITION_SUCCEEDED,
            false,
            rejection.reason,
            rejection.message.clone(),
            now,
        ));
        self.write_status(key, task, &status).await?;
        Ok(Outcome::await_change())
    }

    async fn ensure_agent_labels(&self, key: &TaskKey, task: &Task, agent: &ResolvedAgentRef) -> Result<()> {
        let wanted: BTreeMap<String, String> =
            agent_labels(&agent.namespace, &agent.name).into_iter().collect();
        let labels = task.labels();
        if wanted.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            return Ok(());
        }
        self.ctx.backend.add_labels(key, &wanted).await
    }

    async fn admit_or_queue(&self, key: &TaskKey, task: &Task) -> Result<Outcome> {
        let resolution = resolve(&self.ctx.backend, task, task.resolved_agent()).await?;
        let agent_ref = resolution.agent_ref.clone();
        self.ensure_agent_labels(key, task, &agent_ref).await?;
        let _admission = self.admissions.lock(&agent_ref).await;

        // A previous pass may have created the pod without recording it
        let pod_name = ResourceNaming::pod_name(&key.namespace, &key.name, &agent_ref.namespace);
        if let Some(pod) = self.ctx.backend.get_pod(&agent_ref.namespace, &pod_name).await? {
            info!(pod = %pod_name, "Adopting existing workload");
            let started = pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map_or_else(|| self.now(), |t| t.0);
            return self
                .record_running(key, task, &agent_ref, &pod_name, started)
                .await;
        }

        let siblings = self.sibling_snapshot(&agent_ref).await?;
        let now = self.now();
        let decision = admit(&resolution.agent.spec, key, &siblings, now);

        match &decision {
            Decision::Admit => self.launch(key, task, &resolution).await,
            Decision::Deny {
                reason, message, ..
            } => {
                let delay = requeue_delay(&decision, &self.ctx.config.queue);
                if task.phase() != TaskPhase::Queued {
                    info!(agent = %agent_ref, reason = *reason, "⏳ Task queued");
                } else {
                    debug!(agent = %agent_ref, reason = *reason, "Still waiting");
                }

                let mut status = Self::base_status(task);
                status.phase = Some(TaskPhase::Queued);
                status.agent_ref = Some(agent_ref);
                status.set_condition(condition(CONDITION_QUEUED, true, reason, message.clone(), now));
                status.set_condition(condition(CONDITION_READY, false, reason, message.clone(), now));
                self.write_status(key, task, &status).await?;

                Ok(Outcome::queued(delay))
            }
        }
    }

    async fn launch(&self, key: &TaskKey, task: &Task, resolution: &Resolution) -> Result<Outcome> {
        let agent = &resolution.agent.spec;
        let template = resolution.template.as_ref().map(|t| &t.spec);
        let inputs = merge_inputs(agent, template, &task.spec);

        let namespaces = ContextNamespaces {
            agent: resolution.agent_ref.namespace.clone(),
            template: resolution
                .template
                .as_ref()
                .and_then(|t| t.namespace())
                .unwrap_or_else(|| key.namespace.clone()),
            task: key.namespace.clone(),
        };
        let sources = load_config_sources(&self.ctx.backend, &namespaces, &inputs.contexts).await?;
        let plan = plan_contexts(
            &inputs,
            &agent.workspace_dir,
            &namespaces,
            &sources,
            agent.config.as_deref(),
        )?;

        let uid = task.uid();
        let workload = build_workload(&WorkloadRequest {
            task: key,
            task_uid: uid.as_deref(),
            agent_ref: &resolution.agent_ref,
            agent,
            plan: &plan,
            outputs: &inputs.outputs,
            config: &self.ctx.config,
        })?;

        info!(
            agent = %resolution.agent_ref,
            pod = workload.pod_name(),
            namespace = workload.namespace(),
            "🚀 Creating workload"
        );
        self.ctx.backend.apply_config_map(&workload.config_map).await?;
        self.ctx.backend.create_pod(&workload.pod).await?;

        self.record_running(
            key,
            task,
            &resolution.agent_ref,
            workload.pod_name(),
            self.now(),
        )
        .await
    }

    async fn record_running(
        &self,
        key: &TaskKey,
        task: &Task,
        agent_ref: &ResolvedAgentRef,
        pod_name: &str,
        started: DateTime<Utc>,
    ) -> Result<Outcome> {
        let now = self.now();
        let mut status = Self::base_status(task);
        status.phase = Some(TaskPhase::Running);
        status.agent_ref = Some(agent_ref.clone());
        status.pod_name = Some(pod_name.to_string());
        status.pod_namespace = Some(agent_ref.namespace.clone());
        status.start_time = Some(started.to_rfc3339());
        status.set_condition(condition(
            CONDITION_QUEUED,
            false,
            REASON_CAPACITY_AVAILABLE,
            "Admitted",
            now,
        ));
        status.set_condition(condition(
            CONDITION_READY,
            true,
            REASON_WORKLOAD_CREATED,
            format!("Workload {pod_name} created"),
            now,
        ));
        self.write_status(key, task, &status).await?;
        Ok(Outcome::requeue_after(self.running_poll()))
    }

    async fn observe(&self, key: &TaskKey, task: &Task) -> Result<Outcome> {
        let status = task.status.clone().unwrap_or_default();
        let pod = match (status.pod_namespace.as_deref(), status.pod_name.as_deref()) {
            (Some(namespace), Some(name)) => self.ctx.backend.get_pod(namespace, name).await?,
            _ => None,
        };

        let (succeeded, reason, message) = match workload_state(pod.as_ref()) {
            WorkloadState::Active => return Ok(Outcome::requeue_after(self.running_poll())),
            WorkloadState::Succeeded => (true, REASON_SUCCEEDED, "Task completed".to_string()),
            WorkloadState::Failed(message) => (false, REASON_FAILED, message),
            WorkloadState::Evicted(message) => (false, REASON_EVICTED, message),
            WorkloadState::Missing => (
                false,
                REASON_WORKLOAD_LOST,
                "Workload disappeared before reaching a terminal state".to_string(),
            ),
        };

        let outputs = pod.as_ref().and_then(collected_outputs);
        if succeeded {
            info!(outputs = outputs.as_ref().map_or(0, BTreeMap::len), "✅ Task succeeded");
        } else {
            warn!(reason, message = %message, "Task failed");
        }

        let now = self.now();
        let mut next = Self::base_status(task);
        next.phase = Some(TaskPhase::Completed);
        next.completion_time = Some(now.to_rfc3339());
        next.outputs = outputs;
        next.set_condition(condition(CONDITION_SUCCEEDED, succeeded, reason, message.clone(), now));
        next.set_condition(condition(CONDITION_READY, succeeded, reason, message, now));
        self.write_status(key, task, &next).await?;

        Ok(Outcome::freeing(status.agent_ref))
    }

    async fn stop(&self, key: &TaskKey, task: &Task) -> Result<Outcome> {
        let phase = task.phase();
        let status = task.status.clone().unwrap_or_default();
        info!(%phase, "🛑 Stopping Task");

        if phase == TaskPhase::Running {
            if let (Some(namespace), Some(name)) =
                (status.pod_namespace.as_deref(), status.pod_name.as_deref())
            {
                self.ctx
                    .backend
                    .delete_pod(namespace, name, self.ctx.config.stop.grace_period_seconds)
                    .await?;
            }
        }

        let now = self.now();
        let message = "Task stopped by user";
        let mut next = Self::base_status(task);
        next.phase = Some(TaskPhase::Completed);
        next.completion_time = Some(now.to_rfc3339());
        next.outputs = Some(BTreeMap::new());
        next.set_condition(condition(CONDITION_STOPPED, true, REASON_USER_STOPPED, message, now));
        next.set_condition(condition(CONDITION_SUCCEEDED, false, REASON_USER_STOPPED, message, now));
        next.set_condition(condition(CONDITION_READY, false, REASON_USER_STOPPED, message, now));
        if phase == TaskPhase::Queued {
            next.set_condition(condition(CONDITION_QUEUED, false, REASON_USER_STOPPED, message, now));
        }
        self.write_status(key, task, &next).await?;

        let freed = (phase == TaskPhase::Running).then_some(status.agent_ref).flatten();
        Ok(Outcome::freeing(freed))
    }

    async fn cleanup(&self, key: &TaskKey, task: &Task) -> Result<Outcome> {
        if !task.finalizers().iter().any(|f| f == TASK_FINALIZER) {
            return Ok(Outcome::await_change());
        }
        info!("🧹 Cleaning up Task workload");

        let status = task.status.clone().unwrap_or_default();
        let workload = match (&status.pod_namespace, &status.pod_name, &status.agent_ref) {
            (Some(namespace), Some(name), _) => Some((namespace.clone(), name.clone())),
            // Status may not have caught up with a created pod
            (_, _, Some(agent)) => Some((
                agent.namespace.clone(),
                ResourceNaming::pod_name(&key.namespace, &key.name, &agent.namespace),
            )),
            _ => None,
        };

        if let Some((namespace, pod_name)) = workload {
            let backend = &self.ctx.backend;
            if task.phase() == TaskPhase::Running {
                backend
                    .delete_pod(&namespace, &pod_name, self.ctx.config.stop.grace_period_seconds)
                    .await?;
            } else {
                backend.delete_pod(&namespace, &pod_name, 0).await?;
            }
            backend
                .delete_config_map(&namespace, &ResourceNaming::context_config_map_name(&pod_name))
                .await?;
        }

        self.ctx.backend.remove_finalizer(key, TASK_FINALIZER).await?;

        let freed = (task.phase() == TaskPhase::Running)
            .then_some(status.agent_ref)
            .flatten();
        Ok(Outcome::freeing(freed))
    }
}
