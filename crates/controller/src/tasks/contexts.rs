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

//! Context merging and materialization planning
//!
//! Contexts from the Agent, the template and the Task are concatenated in that
//! order, each remembering where it came from so `ConfigMap` sources are read
//! from the namespace of the object that declared them. The merged list is
//! then split: items without a mount path are
//! rendered into one aggregate instructions file, items with one are
//! materialized at their path. Nothing here touches the workspace; the plan
//! lists what the init steps must do.

use crate::crds::{
    AgentSpec, ContextItem, ContextSource, GitSource, OutputSpec, TaskSpec, TaskTemplateSpec,
    UrlSource,
};
use crate::tasks::backend::ConfigSourceReader;
use crate::tasks::labels::REASON_CONTEXT_ERROR;
use crate::tasks::types::{Rejection, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Aggregate instructions file, relative to the workspace directory
pub const TASK_FILE_NAME: &str = "task.md";

/// Where the context `ConfigMap` is mounted inside the context-init container
pub const CONTEXT_FILES_DIR: &str = "/configmap-files";

/// Instructions synthesized for `Runtime` context items
pub const RUNTIME_CONTEXT: &str = r"## Platform

You are running inside a Kubernetes pod created for a single Task.

- `TASK_NAME` and `TASK_NAMESPACE` identify the Task that launched you.
- `WORKSPACE_DIR` is your working directory; it is discarded when the pod exits.
- Files named as outputs must be written before you exit to be collected.
- The Task is stopped by setting the `agents.platform/stop=true` annotation,
  for example `kubectl annotate task $TASK_NAME -n $TASK_NAMESPACE agents.platform/stop=true`.
- Check progress with `kubectl get task $TASK_NAME -n $TASK_NAMESPACE -o yaml`.";

/// Object that declared a context item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOrigin {
    Agent,
    Template,
    Task,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedContext {
    pub origin: ContextOrigin,
    pub item: ContextItem,
}

impl MergedContext {
    #[must_use]
    pub fn new(origin: ContextOrigin, item: ContextItem) -> Self {
        Self { origin, item }
    }
}

/// Namespaces of the Agent, template and Task a workload is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextNamespaces {
    pub agent: String,
    pub template: String,
    pub task: String,
}

impl ContextNamespaces {
    /// Everything lives in `namespace`
    #[must_use]
    pub fn uniform(namespace: &str) -> Self {
        Self {
            agent: namespace.to_string(),
            template: namespace.to_string(),
            task: namespace.to_string(),
        }
    }

    #[must_use]
    pub fn of(&self, origin: ContextOrigin) -> &str {
        match origin {
            ContextOrigin::Agent => &self.agent,
            ContextOrigin::Template => &self.template,
            ContextOrigin::Task => &self.task,
        }
    }
}

/// Inputs after template and agent defaults have been applied
#[derive(Debug, Clone, Default)]
pub struct MergedInputs {
    pub description: Option<String>,
    pub contexts: Vec<MergedContext>,
    pub outputs: OutputSpec,
}

/// Agent defaults, then template defaults, then the Task's own items.
///
/// Items are appended untouched; nothing is deduplicated or overridden.
#[must_use]
pub fn merge_contexts(
    agent: &AgentSpec,
    template: Option<&TaskTemplateSpec>,
    task: &TaskSpec,
) -> Vec<MergedContext> {
    let tagged = |origin: ContextOrigin, items: &[ContextItem]| {
        items
            .iter()
            .map(move |item| MergedContext::new(origin, item.clone()))
            .collect::<Vec<_>>()
    };

    let mut merged = tagged(ContextOrigin::Agent, agent.contexts.as_slice());
    if let Some(template) = template {
        merged.extend(tagged(ContextOrigin::Template, template.contexts.as_slice()));
    }
    merged.extend(tagged(ContextOrigin::Task, task.contexts.as_slice()));
    merged
}

/// Merge output parameters by name.
///
/// Base order is kept; an override with a known name replaces the entry in
/// place, unknown names are appended.
#[must_use]
pub fn merge_outputs(base: Option<&OutputSpec>, overrides: Option<&OutputSpec>) -> OutputSpec {
    let mut parameters = base.map(|b| b.parameters.clone()).unwrap_or_default();

    for param in overrides.into_iter().flat_map(|o| o.parameters.iter()) {
        match parameters.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param.clone(),
            None => parameters.push(param.clone()),
        }
    }

    OutputSpec { parameters }
}

#[must_use]
pub fn merge_inputs(
    agent: &AgentSpec,
    template: Option<&TaskTemplateSpec>,
    task: &TaskSpec,
) -> MergedInputs {
    let description = task
        .description
        .clone()
        .filter(|d| !d.trim().is_empty())
        .or_else(|| template.and_then(|t| t.description.clone()));

    MergedInputs {
        description,
        contexts: merge_contexts(agent, template, task),
        outputs: merge_outputs(
            template.and_then(|t| t.outputs.as_ref()),
            task.outputs.as_ref(),
        ),
    }
}

/// File copied from the context `ConfigMap` into the workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMapping {
    pub key: String,
    pub target_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<i32>,
}

/// Mount added to the worker container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMount {
    /// A key of the context `ConfigMap`, for paths outside the workspace
    ContextFile {
        key: String,
        path: String,
        mode: Option<i32>,
    },
    /// Part of a scratch volume filled by an init step
    Scratch {
        volume: String,
        sub_path: String,
        path: String,
    },
}

/// External materialization work, run as init containers before the worker
#[derive(Debug, Clone, PartialEq)]
pub enum InitStep {
    /// Copy context `ConfigMap` keys into the workspace
    CopyFiles { mappings: Vec<FileMapping> },
    /// Clone a repository into `volume`, under `repo/`
    GitClone { volume: String, source: GitSource },
    /// Download a URL into `volume`, as `content`
    UrlFetch { volume: String, source: UrlSource },
}

pub const GIT_CLONE_ROOT: &str = "/git";
pub const GIT_CLONE_LINK: &str = "repo";
pub const URL_FETCH_ROOT: &str = "/url";
pub const URL_FETCH_FILE: &str = "content";

/// What must be materialized where
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextPlan {
    pub workspace_dir: String,

    /// Absolute path of the aggregate instructions file
    pub task_file: String,

    /// Data of the context `ConfigMap`
    pub files: BTreeMap<String, String>,

    pub mounts: Vec<WorkerMount>,

    /// Always starts with the `CopyFiles` step that writes the task file
    pub init_steps: Vec<InitStep>,

    /// Validated agent tool configuration
    pub agent_config: Option<String>,
}

impl ContextPlan {
    /// Aggregate instructions file content
    #[must_use]
    pub fn task_document(&self) -> Option<&str> {
        self.files
            .get(&sanitize_key(&self.task_file))
            .map(String::as_str)
    }

    #[must_use]
    pub fn file_mappings(&self) -> &[FileMapping] {
        self.init_steps
            .iter()
            .find_map(|step| match step {
                InitStep::CopyFiles { mappings } => Some(mappings.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}

/// Turn an absolute path into a valid `ConfigMap` key
#[must_use]
pub fn sanitize_key(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "-")
}

fn context_error(message: impl Into<String>) -> Rejection {
    Rejection::new(REASON_CONTEXT_ERROR, message)
}

fn resolve_path(workspace_dir: &str, mount_path: &str) -> Result<String, Rejection> {
    if mount_path.split('/').any(|segment| segment == "..") {
        return Err(context_error(format!(
            "mount path {mount_path} must not contain '..'"
        )));
    }

    if mount_path.starts_with('/') {
        Ok(mount_path.trim_end_matches('/').to_string())
    } else {
        Ok(format!(
            "{}/{}",
            workspace_dir.trim_end_matches('/'),
            mount_path.trim_end_matches('/')
        ))
    }
}

fn within(dir: &str, path: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path == dir || path.starts_with(&format!("{dir}/"))
}

fn item_label(item: &ContextItem, index: usize) -> String {
    item.name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("context-{index}"))
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

fn render_context(item: &ContextItem, index: usize, namespace: &str, content: &str) -> String {
    let mut open = format!(
        "<context name=\"{}\" namespace=\"{}\" type=\"{}\"",
        escape_attr(&item_label(item, index)),
        escape_attr(namespace),
        item.source.type_name()
    );
    if let Some(description) = item.description.as_deref().filter(|d| !d.is_empty()) {
        open.push_str(&format!(" description=\"{}\"", escape_attr(description)));
    }
    format!("{open}>\n{content}\n</context>")
}

fn render_bundle(data: &BTreeMap<String, String>) -> String {
    data.iter()
        .map(|(key, value)| format!("<file name=\"{}\">\n{value}\n</file>", escape_attr(key)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `ConfigMap` data fetched ahead of planning, keyed by (namespace, name);
/// `None` when missing
pub type ConfigSources = BTreeMap<(String, String), Option<BTreeMap<String, String>>>;

/// Fetch the `ConfigMap`s referenced by `contexts`, each from the namespace
/// of the object that declared it
pub async fn load_config_sources<R>(
    reader: &R,
    namespaces: &ContextNamespaces,
    contexts: &[MergedContext],
) -> Result<ConfigSources>
where
    R: ConfigSourceReader + ?Sized,
{
    let mut sources = ConfigSources::new();
    for context in contexts {
        if let ContextSource::ConfigMap { config_map } = &context.item.source {
            let key = (
                namespaces.of(context.origin).to_string(),
                config_map.name.clone(),
            );
            if !sources.contains_key(&key) {
                let data = reader.get_config_data(&key.0, &key.1).await?;
                sources.insert(key, data);
            }
        }
    }
    Ok(sources)
}

struct PlanBuilder<'a> {
    workspace_dir: &'a str,
    files: BTreeMap<String, String>,
    mappings: Vec<FileMapping>,
    mounts: Vec<WorkerMount>,
    steps: Vec<InitStep>,
    targets: BTreeSet<String>,
}

impl PlanBuilder<'_> {
    fn claim(&mut self, path: &str) -> Result<(), Rejection> {
        if self.targets.insert(path.to_string()) {
            Ok(())
        } else {
            Err(context_error(format!("mount path conflict: {path}")))
        }
    }

    fn add_file(&mut self, path: &str, content: String, mode: Option<i32>) -> Result<(), Rejection> {
        self.claim(path)?;
        let key = sanitize_key(path);
        if self.files.insert(key.clone(), content).is_some() {
            return Err(context_error(format!(
                "mount path {path} collides with another file ({key})"
            )));
        }

        if within(self.workspace_dir, path) {
            self.mappings.push(FileMapping {
                key,
                target_path: path.to_string(),
                file_mode: mode,
            });
        } else {
            self.mounts.push(WorkerMount::ContextFile {
                key,
                path: path.to_string(),
                mode,
            });
        }
        Ok(())
    }
}

/// Validate `inputs` and compute the materialization plan.
///
/// Each item's origin namespace is written into its aggregate delimiter;
/// `sources` must hold every `ConfigMap` referenced by the contexts.
pub fn plan_contexts(
    inputs: &MergedInputs,
    workspace_dir: &str,
    namespaces: &ContextNamespaces,
    sources: &ConfigSources,
    agent_config: Option<&str>,
) -> Result<ContextPlan, Rejection> {
    let task_file = format!("{}/{TASK_FILE_NAME}", workspace_dir.trim_end_matches('/'));
    let mut builder = PlanBuilder {
        workspace_dir,
        files: BTreeMap::new(),
        mappings: Vec::new(),
        mounts: Vec::new(),
        steps: Vec::new(),
        targets: BTreeSet::new(),
    };
    let mut aggregate: Vec<String> = inputs
        .description
        .iter()
        .filter(|d| !d.trim().is_empty())
        .cloned()
        .collect();

    for (index, context) in inputs.contexts.iter().enumerate() {
        let item = &context.item;
        let namespace = namespaces.of(context.origin);
        let label = item_label(item, index);
        let mount_path = item
            .mount_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| resolve_path(workspace_dir, p))
            .transpose()?;

        match (&item.source, mount_path) {
            (ContextSource::Text { text }, None) => {
                aggregate.push(render_context(item, index, namespace, text));
            }
            (ContextSource::Text { text }, Some(path)) => {
                builder.add_file(&path, text.clone(), item.file_mode)?;
            }
            // Runtime instructions always belong in the aggregate
            (ContextSource::Runtime, _) => {
                aggregate.push(render_context(item, index, namespace, RUNTIME_CONTEXT));
            }
            (ContextSource::ConfigMap { config_map }, path) => {
                let source_key = (namespace.to_string(), config_map.name.clone());
                let data = match sources.get(&source_key) {
                    Some(Some(data)) => data,
                    _ if config_map.optional => {
                        debug!(context = %label, config_map = %config_map.name, namespace, "Skipping missing optional ConfigMap");
                        continue;
                    }
                    _ => {
                        return Err(context_error(format!(
                            "ConfigMap {namespace}/{} referenced by context {label} not found",
                            config_map.name
                        )))
                    }
                };

                match (&config_map.key, path) {
                    (Some(key), path) => {
                        let Some(value) = data.get(key) else {
                            if config_map.optional {
                                continue;
                            }
                            return Err(context_error(format!(
                                "key {key} not found in ConfigMap {}",
                                config_map.name
                            )));
                        };
                        match path {
                            Some(path) => builder.add_file(&path, value.clone(), item.file_mode)?,
                            None => aggregate.push(render_context(item, index, namespace, value)),
                        }
                    }
                    (None, Some(dir)) => {
                        builder.claim(&dir)?;
                        for (key, value) in data {
                            builder.add_file(&format!("{dir}/{key}"), value.clone(), item.file_mode)?;
                        }
                    }
                    (None, None) => {
                        aggregate.push(render_context(item, index, namespace, &render_bundle(data)));
                    }
                }
            }
            (ContextSource::Git { git }, Some(path)) => {
                if git.repository.trim().is_empty() {
                    return Err(context_error(format!("context {label} has no repository")));
                }
                builder.claim(&path)?;
                let volume = format!("git-context-{index}");
                let sub_path = match git.path.as_deref().map(|p| p.trim_matches('/')) {
                    Some(p) if !p.is_empty() => format!("{GIT_CLONE_LINK}/{p}"),
                    _ => GIT_CLONE_LINK.to_string(),
                };
                builder.steps.push(InitStep::GitClone {
                    volume: volume.clone(),
                    source: git.clone(),
                });
                builder.mounts.push(WorkerMount::Scratch {
                    volume,
                    sub_path,
                    path,
                });
            }
            (ContextSource::Url { url }, Some(path)) => {
                if url.url.trim().is_empty() {
                    return Err(context_error(format!("context {label} has no url")));
                }
                builder.claim(&path)?;
                let volume = format!("url-context-{index}");
                builder.steps.push(InitStep::UrlFetch {
                    volume: volume.clone(),
                    source: url.clone(),
                });
                builder.mounts.push(WorkerMount::Scratch {
                    volume,
                    sub_path: URL_FETCH_FILE.to_string(),
                    path,
                });
            }
            (ContextSource::Git { .. } | ContextSource::Url { .. }, None) => {
                return Err(context_error(format!(
                    "{} context {label} requires a mountPath",
                    item.source.type_name()
                )));
            }
        }
    }

    builder.add_file(&task_file, aggregate.join("\n\n"), None)?;

    let agent_config = match agent_config.filter(|c| !c.trim().is_empty()) {
        Some(raw) => {
            serde_json::from_str::<serde_json::Value>(raw)
                .map_err(|e| context_error(format!("agent config is not valid JSON: {e}")))?;
            Some(raw.to_string())
        }
        None => None,
    };

    let mut init_steps = vec![InitStep::CopyFiles {
        mappings: builder.mappings,
    }];
    init_steps.extend(builder.steps);

    Ok(ContextPlan {
        workspace_dir: workspace_dir.to_string(),
        task_file,
        files: builder.files,
        mounts: builder.mounts,
        init_steps,
        agent_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ConfigMapSource, OutputParameter};
    use crate::tasks::memory::MemoryBackend;

    fn text(name: &str, body: &str) -> ContextItem {
        ContextItem {
            name: Some(name.to_string()),
            description: None,
            mount_path: None,
            file_mode: None,
            source: ContextSource::Text {
                text: body.to_string(),
            },
        }
    }

    fn mounted(name: &str, body: &str, path: &str) -> ContextItem {
        ContextItem {
            mount_path: Some(path.to_string()),
            ..text(name, body)
        }
    }

    fn param(name: &str, path: &str) -> OutputParameter {
        OutputParameter {
            name: name.to_string(),
            path: path.to_string(),
            default: None,
        }
    }

    fn own(items: Vec<ContextItem>) -> Vec<MergedContext> {
        items
            .into_iter()
            .map(|item| MergedContext::new(ContextOrigin::Task, item))
            .collect()
    }

    fn dev() -> ContextNamespaces {
        ContextNamespaces::uniform("dev")
    }

    fn plan(inputs: &MergedInputs) -> Result<ContextPlan, Rejection> {
        plan_contexts(inputs, "/workspace", &dev(), &ConfigSources::new(), None)
    }

    #[test]
    fn test_merge_order_agent_template_task() {
        let agent = AgentSpec {
            contexts: vec![text("A", "a")],
            ..Default::default()
        };
        let template = TaskTemplateSpec {
            contexts: vec![text("B", "b")],
            ..Default::default()
        };
        let task = TaskSpec {
            contexts: vec![text("C", "c")],
            ..Default::default()
        };

        let merged = merge_contexts(&agent, Some(&template), &task);
        let names: Vec<_> = merged
            .iter()
            .filter_map(|c| c.item.name.as_deref())
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        let origins: Vec<_> = merged.iter().map(|c| c.origin).collect();
        assert_eq!(
            origins,
            vec![ContextOrigin::Agent, ContextOrigin::Template, ContextOrigin::Task]
        );
    }

    #[test]
    fn test_merge_outputs_overrides_by_name_and_appends() {
        let template = OutputSpec {
            parameters: vec![param("x", "template-x"), param("y", "template-y")],
        };
        let task = OutputSpec {
            parameters: vec![param("y", "task-y"), param("z", "task-z")],
        };

        let merged = merge_outputs(Some(&template), Some(&task));
        let pairs: Vec<_> = merged
            .parameters
            .iter()
            .map(|p| (p.name.as_str(), p.path.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![("x", "template-x"), ("y", "task-y"), ("z", "task-z")]
        );
    }

    #[test]
    fn test_task_description_wins_over_template() {
        let template = TaskTemplateSpec {
            description: Some("template".to_string()),
            ..Default::default()
        };
        let with = TaskSpec {
            description: Some("task".to_string()),
            ..Default::default()
        };
        let without = TaskSpec::default();
        let agent = AgentSpec::default();

        assert_eq!(
            merge_inputs(&agent, Some(&template), &with).description.as_deref(),
            Some("task")
        );
        assert_eq!(
            merge_inputs(&agent, Some(&template), &without).description.as_deref(),
            Some("template")
        );
    }

    #[test]
    fn test_aggregate_has_description_first_then_contexts() {
        let inputs = MergedInputs {
            description: Some("Fix the bug".to_string()),
            contexts: own(vec![text("A", "alpha"), text("B", "beta")]),
            outputs: OutputSpec::default(),
        };

        let plan = plan(&inputs).unwrap();
        let doc = plan.task_document().unwrap();
        assert!(doc.starts_with("Fix the bug\n\n<context name=\"A\" namespace=\"dev\" type=\"Text\">\nalpha\n</context>"));
        assert!(doc.find("alpha").unwrap() < doc.find("beta").unwrap());
        assert_eq!(plan.task_file, "/workspace/task.md");
        assert_eq!(
            plan.file_mappings(),
            &[FileMapping {
                key: "workspace-task.md".to_string(),
                target_path: "/workspace/task.md".to_string(),
                file_mode: None,
            }]
        );
    }

    #[test]
    fn test_mounted_items_are_not_aggregated() {
        let inputs = MergedInputs {
            contexts: own(vec![
                mounted("guide", "guide body", "docs/guide.md"),
                mounted("cfg", "{}", "/etc/agent/config.json"),
            ]),
            ..Default::default()
        };

        let plan = plan(&inputs).unwrap();
        assert!(!plan.task_document().unwrap().contains("guide body"));
        assert!(plan
            .file_mappings()
            .iter()
            .any(|m| m.target_path == "/workspace/docs/guide.md"));
        assert_eq!(
            plan.mounts,
            vec![WorkerMount::ContextFile {
                key: "etc-agent-config.json".to_string(),
                path: "/etc/agent/config.json".to_string(),
                mode: None,
            }]
        );
    }

    #[test]
    fn test_duplicate_mount_paths_conflict() {
        let inputs = MergedInputs {
            contexts: own(vec![
                mounted("one", "1", "notes.md"),
                mounted("two", "2", "/workspace/notes.md"),
            ]),
            ..Default::default()
        };

        let err = plan(&inputs).unwrap_err();
        assert_eq!(err.reason, REASON_CONTEXT_ERROR);
        assert!(err.message.contains("conflict"));
    }

    #[test]
    fn test_mount_over_task_file_conflicts() {
        let inputs = MergedInputs {
            contexts: own(vec![mounted("sneaky", "x", "task.md")]),
            ..Default::default()
        };
        assert!(plan(&inputs).is_err());
    }

    #[test]
    fn test_git_requires_mount_path() {
        let inputs = MergedInputs {
            contexts: own(vec![ContextItem {
                name: Some("repo".to_string()),
                description: None,
                mount_path: None,
                file_mode: None,
                source: ContextSource::Git {
                    git: GitSource {
                        repository: "https://github.com/example/repo.git".to_string(),
                        git_ref: None,
                        depth: None,
                        path: None,
                        secret_ref: None,
                    },
                },
            }]),
            ..Default::default()
        };
        assert!(plan(&inputs).is_err());

        let mut inputs = inputs;
        inputs.contexts[0].item.mount_path = Some("src".to_string());
        let plan = plan(&inputs).unwrap();
        assert_eq!(plan.init_steps.len(), 2);
        assert!(matches!(&plan.init_steps[1], InitStep::GitClone { volume, .. } if volume == "git-context-0"));
        assert_eq!(
            plan.mounts,
            vec![WorkerMount::Scratch {
                volume: "git-context-0".to_string(),
                sub_path: "repo".to_string(),
                path: "/workspace/src".to_string(),
            }]
        );
    }

    #[test]
    fn test_config_map_contexts() {
        let mut sources = ConfigSources::new();
        sources.insert(
            ("dev".to_string(), "bundle".to_string()),
            Some(BTreeMap::from([
                ("b.md".to_string(), "bee".to_string()),
                ("a.md".to_string(), "ay".to_string()),
            ])),
        );
        sources.insert(("dev".to_string(), "missing".to_string()), None);

        let cm = |key: Option<&str>, mount: Option<&str>, name: &str, optional: bool| ContextItem {
            name: Some(format!("cm-{}", key.unwrap_or("all"))),
            description: None,
            mount_path: mount.map(ToString::to_string),
            file_mode: None,
            source: ContextSource::ConfigMap {
                config_map: ConfigMapSource {
                    name: name.to_string(),
                    key: key.map(ToString::to_string),
                    optional,
                },
            },
        };

        let inputs = MergedInputs {
            contexts: own(vec![
                cm(None, None, "bundle", false),
                cm(Some("a.md"), Some("notes/a.md"), "bundle", false),
                cm(None, Some("bundle-dir"), "bundle", false),
                cm(None, None, "missing", true),
            ]),
            ..Default::default()
        };

        let plan = plan_contexts(&inputs, "/workspace", &dev(), &sources, None).unwrap();
        let doc = plan.task_document().unwrap();
        assert!(doc.contains("<file name=\"a.md\">\nay\n</file>\n<file name=\"b.md\">\nbee\n</file>"));
        let targets: Vec<_> = plan
            .file_mappings()
            .iter()
            .map(|m| m.target_path.as_str())
            .collect();
        assert!(targets.contains(&"/workspace/notes/a.md"));
        assert!(targets.contains(&"/workspace/bundle-dir/a.md"));
        assert!(targets.contains(&"/workspace/bundle-dir/b.md"));

        let required_missing = MergedInputs {
            contexts: own(vec![cm(None, None, "missing", false)]),
            ..Default::default()
        };
        assert!(plan_contexts(&required_missing, "/workspace", &dev(), &sources, None).is_err());
    }

    fn config_map_item(name: &str) -> ContextItem {
        ContextItem {
            name: Some("guide".to_string()),
            description: None,
            mount_path: None,
            file_mode: None,
            source: ContextSource::ConfigMap {
                config_map: ConfigMapSource {
                    name: name.to_string(),
                    key: Some("g".to_string()),
                    optional: false,
                },
            },
        }
    }

    #[tokio::test]
    async fn test_config_maps_read_from_declaring_namespace() {
        let backend = MemoryBackend::new();
        backend.insert_config_map(
            "agents",
            "agent-guide",
            BTreeMap::from([("g".to_string(), "from agents".to_string())]),
        );
        backend.insert_config_map(
            "dev",
            "agent-guide",
            BTreeMap::from([("g".to_string(), "planted in dev".to_string())]),
        );
        let namespaces = ContextNamespaces {
            agent: "agents".to_string(),
            template: "dev".to_string(),
            task: "dev".to_string(),
        };
        let inputs = MergedInputs {
            contexts: vec![MergedContext::new(
                ContextOrigin::Agent,
                config_map_item("agent-guide"),
            )],
            ..Default::default()
        };

        let sources = load_config_sources(&backend, &namespaces, &inputs.contexts)
            .await
            .unwrap();
        assert_eq!(
            sources.keys().collect::<Vec<_>>(),
            vec![&("agents".to_string(), "agent-guide".to_string())]
        );

        let plan = plan_contexts(&inputs, "/workspace", &namespaces, &sources, None).unwrap();
        let doc = plan.task_document().unwrap();
        assert!(doc.contains("<context name=\"guide\" namespace=\"agents\" type=\"ConfigMap\">\nfrom agents\n</context>"));
        assert!(!doc.contains("planted in dev"));
    }

    #[tokio::test]
    async fn test_task_config_map_not_looked_up_in_agent_namespace() {
        let backend = MemoryBackend::new();
        backend.insert_config_map(
            "agents",
            "notes",
            BTreeMap::from([("g".to_string(), "wrong".to_string())]),
        );
        let namespaces = ContextNamespaces {
            agent: "agents".to_string(),
            template: "dev".to_string(),
            task: "dev".to_string(),
        };
        let inputs = MergedInputs {
            contexts: vec![MergedContext::new(ContextOrigin::Task, config_map_item("notes"))],
            ..Default::default()
        };

        let sources = load_config_sources(&backend, &namespaces, &inputs.contexts)
            .await
            .unwrap();
        let err = plan_contexts(&inputs, "/workspace", &namespaces, &sources, None).unwrap_err();
        assert_eq!(err.reason, REASON_CONTEXT_ERROR);
        assert!(err.message.contains("dev/notes"));
    }

    #[test]
    fn test_runtime_context_ignores_mount_path() {
        let inputs = MergedInputs {
            contexts: own(vec![ContextItem {
                name: Some("platform".to_string()),
                description: None,
                mount_path: Some("runtime.md".to_string()),
                file_mode: None,
                source: ContextSource::Runtime,
            }]),
            ..Default::default()
        };
        let plan = plan(&inputs).unwrap();
        assert!(plan.task_document().unwrap().contains("TASK_NAMESPACE"));
        assert_eq!(plan.file_mappings().len(), 1);
    }

    #[test]
    fn test_agent_config_must_be_json() {
        let inputs = MergedInputs::default();
        assert!(plan_contexts(&inputs, "/workspace", &dev(), &ConfigSources::new(), Some("{bad")).is_err());
        let plan =
            plan_contexts(&inputs, "/workspace", &dev(), &ConfigSources::new(), Some(r#"{"model":"x"}"#))
                .unwrap();
        assert_eq!(plan.agent_config.as_deref(), Some(r#"{"model":"x"}"#));
    }

    #[test]
    fn test_parent_segments_rejected() {
        let inputs = MergedInputs {
            contexts: own(vec![mounted("escape", "x", "../etc/passwd")]),
            ..Default::default()
        };
        assert!(plan(&inputs).is_err());
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("/workspace/task.md"), "workspace-task.md");
        assert_eq!(sanitize_key("a/b/c"), "a-b-c");
    }
}
