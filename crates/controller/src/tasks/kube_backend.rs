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

//! Backend traits implemented against a Kubernetes cluster

use crate::crds::{Agent, ResolvedAgentRef, Task, TaskStatus, TaskTemplate};
use crate::tasks::backend::{
    AgentStore, ConfigSourceReader, SiblingLister, TaskStore, TemplateStore, WorkloadSubstrate,
};
use crate::tasks::labels::agent_selector;
use crate::tasks::types::{Result, TaskKey};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    /// Namespace Tasks are watched in; all namespaces when `None`
    namespace: Option<String>,
}

impl KubeBackend {
    #[must_use]
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn watched_tasks(&self) -> Api<Task> {
        match self.namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn tasks(&self, namespace: &str) -> Api<Task> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_metadata(&self, key: &TaskKey, patch: serde_json::Value) -> Result<()> {
        self.tasks(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for KubeBackend {
    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        Ok(self.tasks(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .watched_tasks()
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn update_status(&self, key: &TaskKey, status: &TaskStatus) -> Result<()> {
        let patch = json!({ "status": status });
        // Status subresource, so spec watchers are not retriggered
        self.tasks(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(task = %key, phase = ?status.phase, "Status updated");
        Ok(())
    }

    async fn add_finalizer(&self, key: &TaskKey, finalizer: &str) -> Result<()> {
        let Some(task) = self.get_task(key).await? else {
            return Ok(());
        };
        let mut finalizers = task.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        // resourceVersion turns a concurrent edit into a 409 instead of a lost update
        self.patch_metadata(
            key,
            json!({
                "metadata": {
                    "resourceVersion": task.resource_version(),
                    "finalizers": finalizers
                }
            }),
        )
        .await
    }

    async fn remove_finalizer(&self, key: &TaskKey, finalizer: &str) -> Result<()> {
        let Some(task) = self.get_task(key).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = task
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        if finalizers.len() == task.finalizers().len() {
            return Ok(());
        }

        match self
            .patch_metadata(
                key,
                json!({
                    "metadata": {
                        "resourceVersion": task.resource_version(),
                        "finalizers": finalizers
                    }
                }),
            )
            .await
        {
            Err(crate::tasks::types::Error::KubeError(e)) if is_status(&e, 404) => Ok(()),
            other => other,
        }
    }

    async fn add_labels(&self, key: &TaskKey, labels: &BTreeMap<String, String>) -> Result<()> {
        self.patch_metadata(key, json!({ "metadata": { "labels": labels } }))
            .await
    }

    async fn annotate(&self, key: &TaskKey, annotation: &str, value: &str) -> Result<()> {
        self.patch_metadata(
            key,
            json!({ "metadata": { "annotations": { annotation: value } } }),
        )
        .await
    }
}

#[async_trait]
impl AgentStore for KubeBackend {
    async fn get_agent(&self, namespace: &str, name: &str) -> Result<Option<Agent>> {
        let agents: Api<Agent> = Api::namespaced(self.client.clone(), namespace);
        Ok(agents.get_opt(name).await?)
    }
}

#[async_trait]
impl TemplateStore for KubeBackend {
    async fn get_template(&self, namespace: &str, name: &str) -> Result<Option<TaskTemplate>> {
        let templates: Api<TaskTemplate> = Api::namespaced(self.client.clone(), namespace);
        Ok(templates.get_opt(name).await?)
    }
}

#[async_trait]
impl ConfigSourceReader for KubeBackend {
    async fn get_config_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .config_maps(namespace)
            .get_opt(name)
            .await?
            .map(|cm| cm.data.unwrap_or_default()))
    }
}

#[async_trait]
impl SiblingLister for KubeBackend {
    async fn list_siblings(&self, agent: &ResolvedAgentRef) -> Result<Vec<Task>> {
        let params = ListParams::default().labels(&agent_selector(&agent.namespace, &agent.name));
        Ok(self.watched_tasks().list(&params).await?.items)
    }
}

#[async_trait]
impl WorkloadSubstrate for KubeBackend {
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map.namespace().unwrap_or_default();
        let name = config_map.name_any();
        let api = self.config_maps(&namespace);

        match api.create(&PostParams::default(), config_map).await {
            Ok(_) => {
                info!(config_map = %name, "📄 Created ConfigMap");
                Ok(())
            }
            Err(e) if is_status(&e, 409) => {
                let existing = api.get(&name).await?;
                let mut updated = config_map.clone();
                updated.metadata.resource_version = existing.resource_version();
                api.replace(&name, &PostParams::default(), &updated).await?;
                debug!(config_map = %name, "Replaced existing ConfigMap");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        match self.pods(&namespace).create(&PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => {
                debug!(pod = %pod.name_any(), "Pod already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: u32) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace_period_seconds),
            ..Default::default()
        };
        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => {
                info!(pod = %name, namespace = %namespace, grace_period_seconds, "🗑️ Deleted pod");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
