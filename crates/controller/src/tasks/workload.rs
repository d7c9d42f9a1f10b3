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

//! Pod and context `ConfigMap` construction for an admitted Task
//!
//! Every workload has a tools init container that stages the agent's tool
//! payload into a shared `emptyDir`, and a worker container that runs the
//! agent against the workspace. Context materialization adds init steps
//! ahead of the worker, and declared outputs add a collector sidecar.

use crate::crds::{AgentSpec, Credential, OutputSpec, ResolvedAgentRef};
use crate::tasks::config::{ControllerConfig, ImageConfig};
use crate::tasks::contexts::{
    ContextPlan, InitStep, WorkerMount, CONTEXT_FILES_DIR, GIT_CLONE_LINK, GIT_CLONE_ROOT,
    URL_FETCH_FILE, URL_FETCH_ROOT,
};
use crate::tasks::labels::{
    APP_LABEL, APP_LABEL_VALUE, REASON_AGENT_ERROR, REASON_CREDENTIAL_ERROR, TASK_LABEL,
    TASK_NAMESPACE_LABEL,
};
use crate::tasks::naming::ResourceNaming;
use crate::tasks::types::{Rejection, Result, TaskKey};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const WORKSPACE_VOLUME: &str = "workspace";
pub const TOOLS_VOLUME: &str = "tools";
pub const TOOLS_DIR: &str = "/tools";
pub const CONTEXT_VOLUME: &str = "context-files";

pub const TOOLS_INIT_CONTAINER: &str = "tools-init";
pub const CONTEXT_INIT_CONTAINER: &str = "context-init";
pub const WORKER_CONTAINER: &str = "worker";
pub const OUTPUT_COLLECTOR_CONTAINER: &str = "output-collector";

/// Binary shipped in the system image
pub const TOOLS_BINARY: &str = "task-tools";

/// Mode for secret files mounted without an explicit mode
pub const DEFAULT_SECRET_FILE_MODE: i32 = 0o600;
const SECRET_FILE_NAME: &str = "secret-file";

/// Images for the two core containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Images {
    pub init: String,
    pub worker: String,
}

/// Pick init and worker images.
///
/// | init set | worker set | init image   | worker image   |
/// |----------|------------|--------------|----------------|
/// | yes      | yes        | given init   | given worker   |
/// | yes      | no         | default init | given (legacy) |
/// | no       | yes        | default init | given worker   |
/// | no       | no         | default init | default worker |
///
/// Agents that only set `agentImage` predate the split, when that single
/// field named the image the agent ran in.
#[must_use]
pub fn resolve_images(agent: &AgentSpec, defaults: &ImageConfig) -> Images {
    let given = |image: &Option<String>| image.clone().filter(|i| !i.trim().is_empty());

    match (given(&agent.agent_image), given(&agent.executor_image)) {
        (Some(init), Some(worker)) => Images { init, worker },
        (Some(legacy), None) => Images {
            init: defaults.agent_image.clone(),
            worker: legacy,
        },
        (None, Some(worker)) => Images {
            init: defaults.agent_image.clone(),
            worker,
        },
        (None, None) => Images {
            init: defaults.agent_image.clone(),
            worker: defaults.executor_image.clone(),
        },
    }
}

/// Command used when the agent doesn't set one
#[must_use]
pub fn default_command(task_file: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("{TOOLS_DIR}/agent run \"$(cat {task_file})\""),
    ]
}

/// Container env, mounts and pod volumes derived from credentials
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CredentialWiring {
    pub env: Vec<Value>,
    pub env_from: Vec<Value>,
    pub volumes: Vec<Value>,
    pub mounts: Vec<Value>,
}

fn credential_error(credential: &Credential, problem: &str) -> Rejection {
    Rejection::new(
        REASON_CREDENTIAL_ERROR,
        format!("credential {} {problem}", credential.name),
    )
}

/// Map credential declarations onto the worker container
pub fn wire_credentials(credentials: &[Credential]) -> Result<CredentialWiring, Rejection> {
    let mut wiring = CredentialWiring::default();
    let mut paths = BTreeSet::new();

    for (index, credential) in credentials.iter().enumerate() {
        let secret = &credential.secret_ref.name;
        let env = credential.env.as_deref().filter(|e| !e.is_empty());
        let mount = credential.mount_path.as_deref().filter(|p| !p.is_empty());

        if let Some(path) = mount {
            if !paths.insert(path.to_string()) {
                return Err(credential_error(credential, &format!("reuses mount path {path}")));
            }
        }

        let volume = format!("credential-{index}");
        match (credential.secret_ref.key.as_deref(), env, mount) {
            (_, Some(_), Some(_)) => {
                return Err(credential_error(
                    credential,
                    "must set exactly one of env or mountPath, not both",
                ))
            }
            (Some(key), Some(env), None) => wiring.env.push(json!({
                "name": env,
                "valueFrom": { "secretKeyRef": { "name": secret, "key": key } }
            })),
            (Some(key), None, Some(path)) => {
                let mode = credential.file_mode.unwrap_or(DEFAULT_SECRET_FILE_MODE);
                wiring.volumes.push(json!({
                    "name": volume,
                    "secret": {
                        "secretName": secret,
                        "items": [{ "key": key, "path": SECRET_FILE_NAME, "mode": mode }]
                    }
                }));
                wiring.mounts.push(json!({
                    "name": volume,
                    "mountPath": path,
                    "subPath": SECRET_FILE_NAME,
                    "readOnly": true
                }));
            }
            (Some(_), None, None) => {
                return Err(credential_error(
                    credential,
                    "with a secret key must set exactly one of env or mountPath",
                ))
            }
            (None, Some(_), None) => {
                return Err(credential_error(
                    credential,
                    "sets env but its secretRef has no key",
                ))
            }
            (None, None, Some(path)) => {
                let mode = credential.file_mode.unwrap_or(DEFAULT_SECRET_FILE_MODE);
                wiring.volumes.push(json!({
                    "name": volume,
                    "secret": { "secretName": secret, "defaultMode": mode }
                }));
                wiring.mounts.push(json!({
                    "name": volume,
                    "mountPath": path,
                    "readOnly": true
                }));
            }
            (None, None, None) => wiring.env_from.push(json!({
                "secretRef": { "name": secret }
            })),
        }
    }

    Ok(wiring)
}

/// Everything the builder needs about one admitted Task
pub struct WorkloadRequest<'a> {
    pub task: &'a TaskKey,
    pub task_uid: Option<&'a str>,
    pub agent_ref: &'a ResolvedAgentRef,
    pub agent: &'a AgentSpec,
    pub plan: &'a ContextPlan,
    pub outputs: &'a OutputSpec,
    pub config: &'a ControllerConfig,
}

/// Objects to create for one Task
#[derive(Debug, Clone)]
pub struct Workload {
    pub pod: Pod,
    pub config_map: ConfigMap,
}

impl Workload {
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.pod.metadata.namespace.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn pod_name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn config_map_name(&self) -> &str {
        self.config_map.metadata.name.as_deref().unwrap_or_default()
    }
}

fn workload_labels(req: &WorkloadRequest<'_>) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = req
        .agent
        .pod_spec
        .as_ref()
        .map(|p| p.labels.clone())
        .unwrap_or_default();
    labels.insert(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string());
    labels.insert(TASK_LABEL.to_string(), req.task.name.clone());
    labels.insert(TASK_NAMESPACE_LABEL.to_string(), req.task.namespace.clone());
    labels
}

// Owner references cannot cross namespaces; cross-namespace workloads are
// reclaimed by the Task finalizer instead.
fn owner_references(req: &WorkloadRequest<'_>) -> Option<Vec<OwnerReference>> {
    if req.task.namespace != req.agent_ref.namespace {
        return None;
    }
    let uid = req.task_uid?;
    Some(vec![OwnerReference {
        api_version: "agents.platform/v1alpha1".to_string(),
        kind: "Task".to_string(),
        name: req.task.name.clone(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }])
}

fn env(name: &str, value: impl Into<String>) -> Value {
    json!({ "name": name, "value": value.into() })
}

fn optional_secret_env(name: &str, secret: &str, key: &str) -> Value {
    json!({
        "name": name,
        "valueFrom": { "secretKeyRef": { "name": secret, "key": key, "optional": true } }
    })
}

fn tools_command(subcommand: &str) -> Vec<String> {
    vec![TOOLS_BINARY.to_string(), subcommand.to_string()]
}

fn init_step_container(
    index: usize,
    step: &InitStep,
    plan: &ContextPlan,
    system_image: &str,
    pull_policy: &str,
) -> Result<Value> {
    let container = match step {
        InitStep::CopyFiles { mappings } => json!({
            "name": CONTEXT_INIT_CONTAINER,
            "image": system_image,
            "imagePullPolicy": pull_policy,
            "command": tools_command("context-init"),
            "env": [
                env("WORKSPACE_DIR", plan.workspace_dir.clone()),
                env("CONFIGMAP_PATH", CONTEXT_FILES_DIR),
                env("FILE_MAPPINGS", serde_json::to_string(mappings)?),
            ],
            "volumeMounts": [
                { "name": WORKSPACE_VOLUME, "mountPath": plan.workspace_dir },
                { "name": CONTEXT_VOLUME, "mountPath": CONTEXT_FILES_DIR, "readOnly": true },
            ]
        }),
        InitStep::GitClone { volume, source } => {
            let mut env_vars = vec![
                env("GIT_REPO", source.repository.clone()),
                env("GIT_REF", source.git_ref.clone().unwrap_or_else(|| "HEAD".to_string())),
                env("GIT_DEPTH", source.depth.unwrap_or(1).to_string()),
                env("GIT_ROOT", GIT_CLONE_ROOT),
                env("GIT_LINK", GIT_CLONE_LINK),
            ];
            if let Some(secret) = source.secret_ref.as_deref() {
                env_vars.push(optional_secret_env("GIT_USERNAME", secret, "username"));
                env_vars.push(optional_secret_env("GIT_PASSWORD", secret, "password"));
            }
            json!({
                "name": format!("git-init-{index}"),
                "image": system_image,
                "imagePullPolicy": pull_policy,
                "command": tools_command("git-init"),
                "env": env_vars,
                "volumeMounts": [{ "name": volume, "mountPath": GIT_CLONE_ROOT }]
            })
        }
        InitStep::UrlFetch { volume, source } => {
            let mut env_vars = vec![
                env("URL_SOURCE", source.url.clone()),
                env("URL_TARGET", format!("{URL_FETCH_ROOT}/{URL_FETCH_FILE}")),
            ];
            if !source.headers.is_empty() {
                env_vars.push(env("URL_HEADERS", serde_json::to_string(&source.headers)?));
            }
            if let Some(timeout) = source.timeout_seconds {
                env_vars.push(env("URL_TIMEOUT", timeout.to_string()));
            }
            if source.insecure {
                env_vars.push(env("URL_INSECURE", "true"));
            }
            if let Some(secret) = source.secret_ref.as_deref() {
                env_vars.push(optional_secret_env("URL_AUTH_TOKEN", secret, "token"));
                env_vars.push(optional_secret_env("URL_AUTH_USERNAME", secret, "username"));
                env_vars.push(optional_secret_env("URL_AUTH_PASSWORD", secret, "password"));
            }
            json!({
                "name": format!("url-fetch-{index}"),
                "image": system_image,
                "imagePullPolicy": pull_policy,
                "command": tools_command("url-fetch"),
                "env": env_vars,
                "volumeMounts": [{ "name": volume, "mountPath": URL_FETCH_ROOT }]
            })
        }
    };
    Ok(container)
}

fn dedup_env(vars: Vec<Value>) -> Vec<Value> {
    let mut seen = BTreeSet::new();
    vars.into_iter()
        .filter(|v| {
            v.get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| seen.insert(name.to_string()))
        })
        .collect()
}

fn invalid_placement(e: &serde_json::Error) -> crate::tasks::types::Error {
    Rejection::new(
        REASON_AGENT_ERROR,
        format!("Agent pod settings do not form a valid pod: {e}"),
    )
    .into()
}

/// Build the context `ConfigMap` and the pod for an admitted Task
#[allow(clippy::too_many_lines)]
pub fn build_workload(req: &WorkloadRequest<'_>) -> Result<Workload> {
    let namespace = req.agent_ref.namespace.clone();
    let pod_name = ResourceNaming::pod_name(&req.task.namespace, &req.task.name, &namespace);
    let cm_name = ResourceNaming::context_config_map_name(&pod_name);
    let labels = workload_labels(req);
    let owners = owner_references(req);
    let images = resolve_images(req.agent, &req.config.images);
    let system_image = req.config.images.system_image.as_str();
    let pull_policy = req.config.images.image_pull_policy.as_str();
    let plan = req.plan;
    let ws = plan.workspace_dir.as_str();

    let credentials = wire_credentials(&req.agent.credentials)?;

    let mut volumes = vec![
        json!({ "name": WORKSPACE_VOLUME, "emptyDir": {} }),
        json!({ "name": TOOLS_VOLUME, "emptyDir": {} }),
        json!({ "name": CONTEXT_VOLUME, "configMap": { "name": cm_name } }),
    ];

    let mut init_containers = vec![json!({
        "name": TOOLS_INIT_CONTAINER,
        "image": images.init,
        "imagePullPolicy": pull_policy,
        "env": [env("TOOLS_DIR", TOOLS_DIR)],
        "volumeMounts": [{ "name": TOOLS_VOLUME, "mountPath": TOOLS_DIR }]
    })];

    for (index, step) in plan.init_steps.iter().enumerate() {
        match step {
            InitStep::GitClone { volume, .. } | InitStep::UrlFetch { volume, .. } => {
                volumes.push(json!({ "name": volume, "emptyDir": {} }));
            }
            InitStep::CopyFiles { .. } => {}
        }
        init_containers.push(init_step_container(index, step, plan, system_image, pull_policy)?);
    }

    let mut worker_mounts = vec![
        json!({ "name": WORKSPACE_VOLUME, "mountPath": ws }),
        json!({ "name": TOOLS_VOLUME, "mountPath": TOOLS_DIR }),
    ];
    for (index, mount) in plan.mounts.iter().enumerate() {
        worker_mounts.push(match mount {
            WorkerMount::ContextFile { key, path, mode: None } => json!({
                "name": CONTEXT_VOLUME,
                "mountPath": path,
                "subPath": key,
                "readOnly": true
            }),
            // A mode needs its own projection of the key
            WorkerMount::ContextFile {
                key,
                path,
                mode: Some(mode),
            } => {
                let volume = format!("{CONTEXT_VOLUME}-{index}");
                volumes.push(json!({
                    "name": volume,
                    "configMap": {
                        "name": cm_name,
                        "items": [{ "key": key, "path": key, "mode": mode }]
                    }
                }));
                json!({
                    "name": volume,
                    "mountPath": path,
                    "subPath": key,
                    "readOnly": true
                })
            }
            WorkerMount::Scratch {
                volume,
                sub_path,
                path,
            } => json!({ "name": volume, "mountPath": path, "subPath": sub_path }),
        });
    }
    worker_mounts.extend(credentials.mounts);
    volumes.extend(credentials.volumes);

    let mut worker_env = vec![
        env("HOME", "/tmp"),
        env("SHELL", "/bin/bash"),
        env("TASK_NAME", req.task.name.clone()),
        env("TASK_NAMESPACE", req.task.namespace.clone()),
        env("WORKSPACE_DIR", ws),
        env("TOOLS_DIR", TOOLS_DIR),
    ];
    if let Some(config) = plan.agent_config.as_deref() {
        worker_env.push(env("AGENT_CONFIG_CONTENT", config));
    }
    worker_env.extend(credentials.env);

    let command = req
        .agent
        .command
        .clone()
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| default_command(&plan.task_file));

    let mut worker = json!({
        "name": WORKER_CONTAINER,
        "image": images.worker,
        "imagePullPolicy": pull_policy,
        "command": command,
        "workingDir": ws,
        "env": dedup_env(worker_env),
        "volumeMounts": worker_mounts
    });
    if !credentials.env_from.is_empty() {
        worker["envFrom"] = json!(credentials.env_from);
    }

    let placement = req.agent.pod_spec.clone().unwrap_or_default();
    if let Some(resources) = placement.resources {
        worker["resources"] = resources;
    }

    let mut containers = vec![worker];
    let collect_outputs = !req.outputs.parameters.is_empty();
    if collect_outputs {
        containers.push(json!({
            "name": OUTPUT_COLLECTOR_CONTAINER,
            "image": system_image,
            "imagePullPolicy": pull_policy,
            "command": tools_command("collect-outputs"),
            "env": [
                env("OUTPUT_SPEC", serde_json::to_string(req.outputs)?),
                env("WORKSPACE_DIR", ws),
            ],
            "terminationMessagePath": "/dev/termination-log",
            "terminationMessagePolicy": "File",
            "volumeMounts": [{ "name": WORKSPACE_VOLUME, "mountPath": ws, "readOnly": true }]
        }));
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "serviceAccountName": req.agent.service_account_name,
        "initContainers": init_containers,
        "containers": containers,
        "volumes": volumes
    });
    if collect_outputs {
        // The collector watches for the worker's processes to exit
        pod_spec["shareProcessNamespace"] = json!(true);
    }
    if let Some(class) = placement.runtime_class_name {
        pod_spec["runtimeClassName"] = json!(class);
    }
    if !placement.node_selector.is_empty() {
        pod_spec["nodeSelector"] = json!(placement.node_selector);
    }
    if !placement.tolerations.is_empty() {
        pod_spec["tolerations"] = json!(placement.tolerations);
    }
    if let Some(affinity) = placement.affinity {
        pod_spec["affinity"] = affinity;
    }

    let metadata = ObjectMeta {
        name: Some(pod_name),
        namespace: Some(namespace.clone()),
        labels: Some(labels.clone()),
        owner_references: owners.clone(),
        ..Default::default()
    };
    let mut pod_json = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "spec": pod_spec
    });
    pod_json["metadata"] = serde_json::to_value(&metadata)?;
    let pod: Pod = serde_json::from_value(pod_json).map_err(|e| invalid_placement(&e))?;

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(cm_name),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: owners,
            ..Default::default()
        },
        data: Some(plan.files.clone()),
        ..Default::default()
    };

    Ok(Workload { pod, config_map })
}
