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

//! In-memory backend
//!
//! Behaves like the cluster where the reconciler can tell the difference:
//! creating an existing pod succeeds, deleting a missing one succeeds, and a
//! Task marked for deletion disappears once its last finalizer is removed.
//! Failures and latency can be injected per operation to exercise retry paths
//! and races.

use crate::crds::{Agent, AgentSpec, ResolvedAgentRef, Task, TaskStatus, TaskTemplate, TaskTemplateSpec};
use crate::tasks::admission::{Clock, SystemClock};
use crate::tasks::backend::{
    AgentStore, ConfigSourceReader, SiblingLister, TaskStore, TemplateStore, WorkloadSubstrate,
};
use crate::tasks::labels::agent_labels;
use crate::tasks::types::{Error, Result, TaskKey};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

type ObjectKey = (String, String);

fn object_key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

/// A pod deletion as seen by the substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedPod {
    pub namespace: String,
    pub name: String,
    pub grace_period_seconds: u32,
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<TaskKey, Task>,
    agents: BTreeMap<ObjectKey, Agent>,
    templates: BTreeMap<ObjectKey, TaskTemplate>,
    config_maps: BTreeMap<ObjectKey, ConfigMap>,
    pods: BTreeMap<ObjectKey, Pod>,
    deleted_pods: Vec<DeletedPod>,
    pod_creations: usize,
    sequence: i64,
}

struct Inner {
    state: RwLock<State>,
    failures: Mutex<BTreeMap<&'static str, u32>>,
    latency: Mutex<BTreeMap<&'static str, Duration>>,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creation timestamps are taken from `clock`
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                failures: Mutex::new(BTreeMap::new()),
                latency: Mutex::new(BTreeMap::new()),
                clock,
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` calls of `operation` fail with a backend error
    pub fn fail_next(&self, operation: &'static str, count: u32) {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation, count);
    }

    /// Make every call of `operation` take at least `delay`
    pub fn slow_down(&self, operation: &'static str, delay: Duration) {
        self.inner
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation, delay);
    }

    async fn check(&self, operation: &'static str) -> Result<()> {
        let delay = self
            .inner
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut failures = self
            .inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match failures.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::BackendError(format!("injected {operation} failure")))
            }
            _ => Ok(()),
        }
    }

    /// Store a Task as the API server would on create.
    ///
    /// Creation timestamps follow insertion order.
    pub fn insert_task(&self, mut task: Task) -> TaskKey {
        let mut state = self.write();
        state.sequence += 1;
        let sequence = state.sequence;

        if task.metadata.namespace.is_none() {
            task.metadata.namespace = Some("default".to_string());
        }
        if task.metadata.creation_timestamp.is_none() {
            let created = self.inner.clock.now() + ChronoDuration::milliseconds(sequence);
            task.metadata.creation_timestamp = Some(Time(created));
        }
        task.metadata.uid.get_or_insert_with(|| format!("task-uid-{sequence}"));
        task.metadata.generation.get_or_insert(1);

        let key = TaskKey::new(task.namespace().unwrap_or_default(), task.name_any());
        state.tasks.insert(key.clone(), task);
        key
    }

    pub fn insert_agent(&self, namespace: &str, name: &str, spec: AgentSpec) {
        let mut agent = Agent::new(name, spec);
        agent.metadata.namespace = Some(namespace.to_string());
        self.write().agents.insert(object_key(namespace, name), agent);
    }

    pub fn remove_agent(&self, namespace: &str, name: &str) {
        self.write().agents.remove(&object_key(namespace, name));
    }

    pub fn insert_template(&self, namespace: &str, name: &str, spec: TaskTemplateSpec) {
        let mut template = TaskTemplate::new(name, spec);
        template.metadata.namespace = Some(namespace.to_string());
        self.write()
            .templates
            .insert(object_key(namespace, name), template);
    }

    pub fn insert_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        let mut config_map = ConfigMap {
            data: Some(data),
            ..Default::default()
        };
        config_map.metadata.name = Some(name.to_string());
        config_map.metadata.namespace = Some(namespace.to_string());
        self.write()
            .config_maps
            .insert(object_key(namespace, name), config_map);
    }

    #[must_use]
    pub fn task(&self, key: &TaskKey) -> Option<Task> {
        self.read().tasks.get(key).cloned()
    }

    #[must_use]
    pub fn status(&self, key: &TaskKey) -> Option<TaskStatus> {
        self.task(key).and_then(|t| t.status)
    }

    #[must_use]
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.read().pods.get(&object_key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.read()
            .config_maps
            .get(&object_key(namespace, name))
            .cloned()
    }

    #[must_use]
    pub fn pod_count(&self) -> usize {
        self.read().pods.len()
    }

    /// Pods created through the substrate, including ones since deleted
    #[must_use]
    pub fn pod_creations(&self) -> usize {
        self.read().pod_creations
    }

    #[must_use]
    pub fn deleted_pods(&self) -> Vec<DeletedPod> {
        self.read().deleted_pods.clone()
    }

    /// Replace the status the kubelet would report
    pub fn set_pod_status(&self, namespace: &str, name: &str, status: PodStatus) -> bool {
        match self.write().pods.get_mut(&object_key(namespace, name)) {
            Some(pod) => {
                pod.status = Some(status);
                true
            }
            None => false,
        }
    }

    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) -> bool {
        self.set_pod_status(
            namespace,
            name,
            PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            },
        )
    }

    /// Drop a pod behind the controller's back
    pub fn evict_pod(&self, namespace: &str, name: &str) {
        self.write().pods.remove(&object_key(namespace, name));
    }

    /// Delete a Task the way the API server does: it lingers with a deletion
    /// timestamp while finalizers remain.
    pub fn delete_task(&self, key: &TaskKey) {
        let now = self.inner.clock.now();
        let mut state = self.write();
        let gone = match state.tasks.get_mut(key) {
            Some(task) if task.finalizers().is_empty() => true,
            Some(task) => {
                task.metadata.deletion_timestamp = Some(Time(now));
                false
            }
            None => false,
        };
        if gone {
            state.tasks.remove(key);
        }
    }

    fn with_task<T>(&self, key: &TaskKey, f: impl FnOnce(&mut Task) -> T) -> Result<T> {
        let mut state = self.write();
        let task = state
            .tasks
            .get_mut(key)
            .ok_or_else(|| Error::BackendError(format!("task {key} not found")))?;
        Ok(f(task))
    }
}

#[async_trait]
impl TaskStore for MemoryBackend {
    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        self.check("get_task").await?;
        Ok(self.task(key))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.check("list_tasks").await?;
        Ok(self.read().tasks.values().cloned().collect())
    }

    async fn update_status(&self, key: &TaskKey, status: &TaskStatus) -> Result<()> {
        self.check("update_status").await?;
        self.with_task(key, |task| task.status = Some(status.clone()))
    }

    async fn add_finalizer(&self, key: &TaskKey, finalizer: &str) -> Result<()> {
        self.check("add_finalizer").await?;
        self.with_task(key, |task| {
            let finalizers = task.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        })
    }

    async fn remove_finalizer(&self, key: &TaskKey, finalizer: &str) -> Result<()> {
        self.check("remove_finalizer").await?;
        let mut state = self.write();
        let gone = match state.tasks.get_mut(key) {
            Some(task) => {
                if let Some(finalizers) = task.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != finalizer);
                }
                task.metadata.deletion_timestamp.is_some() && task.finalizers().is_empty()
            }
            None => false,
        };
        if gone {
            state.tasks.remove(key);
        }
        Ok(())
    }

    async fn add_labels(&self, key: &TaskKey, labels: &BTreeMap<String, String>) -> Result<()> {
        self.check("add_labels").await?;
        self.with_task(key, |task| {
            task.labels_mut()
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        })
    }

    async fn annotate(&self, key: &TaskKey, annotation: &str, value: &str) -> Result<()> {
        self.check("annotate").await?;
        self.with_task(key, |task| {
            task.annotations_mut()
                .insert(annotation.to_string(), value.to_string());
        })
    }
}

#[async_trait]
impl AgentStore for MemoryBackend {
    async fn get_agent(&self, namespace: &str, name: &str) -> Result<Option<Agent>> {
        self.check("get_agent").await?;
        Ok(self.read().agents.get(&object_key(namespace, name)).cloned())
    }
}

#[async_trait]
impl TemplateStore for MemoryBackend {
    async fn get_template(&self, namespace: &str, name: &str) -> Result<Option<TaskTemplate>> {
        self.check("get_template").await?;
        Ok(self
            .read()
            .templates
            .get(&object_key(namespace, name))
            .cloned())
    }
}

#[async_trait]
impl ConfigSourceReader for MemoryBackend {
    async fn get_config_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        self.check("get_config_data").await?;
        Ok(self
            .config_map(namespace, name)
            .map(|cm| cm.data.unwrap_or_default()))
    }
}

#[async_trait]
impl SiblingLister for MemoryBackend {
    async fn list_siblings(&self, agent: &ResolvedAgentRef) -> Result<Vec<Task>> {
        self.check("list_siblings").await?;
        let wanted = agent_labels(&agent.namespace, &agent.name);
        Ok(self
            .read()
            .tasks
            .values()
            .filter(|task| {
                let labels = task.labels();
                wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkloadSubstrate for MemoryBackend {
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        self.check("apply_config_map").await?;
        let key = object_key(
            config_map.metadata.namespace.as_deref().unwrap_or_default(),
            &config_map.name_any(),
        );
        self.write().config_maps.insert(key, config_map.clone());
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.check("create_pod").await?;
        let key = object_key(
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            &pod.name_any(),
        );
        let now = self.inner.clock.now();
        let mut state = self.write();
        if !state.pods.contains_key(&key) {
            let mut pod = pod.clone();
            pod.metadata.creation_timestamp = Some(Time(now));
            state.pods.insert(key, pod);
            state.pod_creations += 1;
        }
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.check("get_pod").await?;
        Ok(self.pod(namespace, name))
    }

    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: u32) -> Result<()> {
        self.check("delete_pod").await?;
        let mut state = self.write();
        if state.pods.remove(&object_key(namespace, name)).is_some() {
            state.deleted_pods.push(DeletedPod {
                namespace: namespace.to_string(),
                name: name.to_string(),
                grace_period_seconds,
            });
        }
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.check("delete_config_map").await?;
        self.write().config_maps.remove(&object_key(namespace, name));
        Ok(())
    }
}
