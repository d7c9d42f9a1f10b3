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

//! Agent and template reference resolution
//!
//! Turns whatever a Task declares (explicit agent, template, or nothing) into
//! a concrete agent `(namespace, name)` and checks that the Task's namespace is
//! allowed to use it. Every failure here is a [`Rejection`]: retrying will not
//! help, and once a reference is frozen into status it is never re-resolved.

use crate::crds::{Agent, AgentReference, ResolvedAgentRef, Task, TaskTemplate};
use crate::tasks::backend::{AgentStore, TemplateStore};
use crate::tasks::labels::{REASON_AGENT_ERROR, REASON_TEMPLATE_ERROR};
use crate::tasks::types::{Error, Rejection, Result};
use glob::Pattern;
use kube::ResourceExt;
use tracing::{debug, warn};

/// Agent used when neither the Task nor its template names one
pub const DEFAULT_AGENT_NAME: &str = "default";

/// A Task's references, resolved and fetched
#[derive(Debug, Clone)]
pub struct Resolution {
    pub agent_ref: ResolvedAgentRef,
    pub agent: Agent,
    pub template: Option<TaskTemplate>,
}

fn task_namespace(task: &Task) -> String {
    task.namespace().unwrap_or_else(|| "default".to_string())
}

fn or_namespace(namespace: Option<&String>, fallback: &str) -> String {
    namespace
        .filter(|ns| !ns.is_empty())
        .cloned()
        .unwrap_or_else(|| fallback.to_string())
}

/// Template `(namespace, name)` declared by the Task, if any
#[must_use]
pub fn template_ref(task: &Task) -> Option<(String, String)> {
    let reference = task.spec.task_template_ref.as_ref()?;
    let namespace = or_namespace(reference.namespace.as_ref(), &task_namespace(task));
    Some((namespace, reference.name.clone()))
}

/// Pick the agent reference: the Task's own, then the template's, then the default.
///
/// An empty namespace always means the Task's namespace, even when the
/// reference came from a template living elsewhere.
#[must_use]
pub fn agent_ref(task: &Task, template: Option<&TaskTemplate>) -> ResolvedAgentRef {
    let namespace = task_namespace(task);
    let declared: Option<&AgentReference> = task
        .spec
        .agent_ref
        .as_ref()
        .filter(|r| !r.name.is_empty())
        .or_else(|| {
            template
                .and_then(|t| t.spec.agent_ref.as_ref())
                .filter(|r| !r.name.is_empty())
        });

    match declared {
        Some(reference) => ResolvedAgentRef {
            namespace: or_namespace(reference.namespace.as_ref(), &namespace),
            name: reference.name.clone(),
        },
        None => ResolvedAgentRef {
            namespace,
            name: DEFAULT_AGENT_NAME.to_string(),
        },
    }
}

/// Glob match of `namespace` against an allow-list.
///
/// An empty list allows everything. Invalid patterns never match.
#[must_use]
pub fn namespace_allowed(patterns: &[String], namespace: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }

    patterns.iter().any(|raw| match Pattern::new(raw) {
        Ok(pattern) => pattern.matches(namespace),
        Err(e) => {
            warn!(pattern = %raw, error = %e, "Ignoring invalid namespace pattern");
            false
        }
    })
}

/// Check that `agent` may serve a Task from `task_namespace`
pub fn check_agent(agent: &Agent, agent_ref: &ResolvedAgentRef, task_namespace: &str) -> Result<()> {
    if !namespace_allowed(&agent.spec.allowed_namespaces, task_namespace) {
        return Err(Rejection::new(
            REASON_AGENT_ERROR,
            format!("namespace {task_namespace} is not allowed to use Agent {agent_ref}"),
        )
        .into());
    }

    if agent.spec.service_account_name.trim().is_empty() {
        return Err(Rejection::new(
            REASON_AGENT_ERROR,
            format!("Agent {agent_ref} has no serviceAccountName"),
        )
        .into());
    }

    Ok(())
}

async fn fetch_template<S>(store: &S, task: &Task) -> Result<Option<TaskTemplate>>
where
    S: TemplateStore + ?Sized,
{
    let Some((namespace, name)) = template_ref(task) else {
        return Ok(None);
    };

    match store.get_template(&namespace, &name).await? {
        Some(template) => Ok(Some(template)),
        None => Err(Rejection::new(
            REASON_TEMPLATE_ERROR,
            format!("TaskTemplate {namespace}/{name} not found"),
        )
        .into()),
    }
}

async fn fetch_agent<S>(store: &S, agent_ref: &ResolvedAgentRef) -> Result<Agent>
where
    S: AgentStore + ?Sized,
{
    store
        .get_agent(&agent_ref.namespace, &agent_ref.name)
        .await?
        .ok_or_else(|| Rejection::new(REASON_AGENT_ERROR, format!("Agent {agent_ref} not found")).into())
}

/// Resolve a Task's references.
///
/// When `frozen` is set (the reference recorded in status) it is used as-is
/// instead of being derived again from the Task spec and template.
pub async fn resolve<S>(store: &S, task: &Task, frozen: Option<&ResolvedAgentRef>) -> Result<Resolution>
where
    S: AgentStore + TemplateStore + ?Sized,
{
    let namespace = task_namespace(task);
    let (agent_ref, template) = match frozen {
        // The template only contributes defaults once the reference is frozen
        Some(frozen) => match fetch_template(store, task).await {
            Err(Error::Rejected(rejection)) => {
                warn!(task = %task.name_any(), message = %rejection.message, "Template gone, continuing without its defaults");
                (frozen.clone(), None)
            }
            other => (frozen.clone(), other?),
        },
        None => {
            let template = fetch_template(store, task).await?;
            (agent_ref(task, template.as_ref()), template)
        }
    };

    let agent = fetch_agent(store, &agent_ref).await?;
    check_agent(&agent, &agent_ref, &namespace)?;

    debug!(
        task = %task.name_any(),
        agent = %agent_ref,
        frozen = frozen.is_some(),
        "Resolved agent reference"
    );

    Ok(Resolution {
        agent_ref,
        agent,
        template,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AgentSpec, TaskSpec, TaskTemplateSpec, TemplateReference};
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn task(namespace: &str, spec: TaskSpec) -> Task {
        let mut task = Task::new("t", spec);
        task.metadata.namespace = Some(namespace.to_string());
        task
    }

    fn template(agent: Option<AgentReference>) -> TaskTemplate {
        let mut template = TaskTemplate::new(
            "tpl",
            TaskTemplateSpec {
                agent_ref: agent,
                ..Default::default()
            },
        );
        template.metadata.namespace = Some("shared".to_string());
        template
    }

    fn agent(allowed: &[&str]) -> Agent {
        Agent::new(
            "a",
            AgentSpec {
                service_account_name: "runner".to_string(),
                allowed_namespaces: allowed.iter().map(ToString::to_string).collect(),
                ..Default::default()
            },
        )
    }

    #[derive(Default)]
    struct Store {
        agents: HashMap<(String, String), Agent>,
        templates: HashMap<(String, String), TaskTemplate>,
    }

    #[async_trait]
    impl AgentStore for Store {
        async fn get_agent(&self, namespace: &str, name: &str) -> Result<Option<Agent>> {
            Ok(self
                .agents
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }

    #[async_trait]
    impl TemplateStore for Store {
        async fn get_template(&self, namespace: &str, name: &str) -> Result<Option<TaskTemplate>> {
            Ok(self
                .templates
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }

    #[test]
    fn test_allow_list_globs() {
        let patterns = vec!["dev-*".to_string(), "staging".to_string()];
        assert!(namespace_allowed(&patterns, "dev-team-a"));
        assert!(namespace_allowed(&patterns, "staging"));
        assert!(!namespace_allowed(&patterns, "prod"));
        assert!(!namespace_allowed(&patterns, "staging-2"));
    }

    #[test]
    fn test_empty_allow_list_allows_all() {
        assert!(namespace_allowed(&[], "anything"));
    }

    #[test]
    fn test_invalid_pattern_matches_nothing() {
        let patterns = vec!["[".to_string()];
        assert!(!namespace_allowed(&patterns, "["));
    }

    #[test]
    fn test_empty_namespace_defaults_to_task_namespace() {
        let t = task(
            "dev-a",
            TaskSpec {
                agent_ref: Some(AgentReference {
                    name: "coder".to_string(),
                    namespace: Some(String::new()),
                }),
                ..Default::default()
            },
        );
        let resolved = agent_ref(&t, None);
        assert_eq!(resolved.namespace, "dev-a");
        assert_eq!(resolved.name, "coder");
    }

    #[test]
    fn test_task_reference_overrides_template() {
        let t = task(
            "dev-a",
            TaskSpec {
                agent_ref: Some(AgentReference {
                    name: "mine".to_string(),
                    namespace: None,
                }),
                ..Default::default()
            },
        );
        let tpl = template(Some(AgentReference {
            name: "theirs".to_string(),
            namespace: Some("agents".to_string()),
        }));
        assert_eq!(agent_ref(&t, Some(&tpl)).name, "mine");
    }

    #[test]
    fn test_template_reference_used_when_task_has_none() {
        let t = task("dev-a", TaskSpec::default());
        let tpl = template(Some(AgentReference {
            name: "theirs".to_string(),
            namespace: Some("agents".to_string()),
        }));
        let resolved = agent_ref(&t, Some(&tpl));
        assert_eq!(resolved.namespace, "agents");
        assert_eq!(resolved.name, "theirs");

        let fallback = agent_ref(&t, None);
        assert_eq!(fallback.name, DEFAULT_AGENT_NAME);
        assert_eq!(fallback.namespace, "dev-a");
    }

    #[tokio::test]
    async fn test_resolve_rejects_disallowed_namespace() {
        let mut store = Store::default();
        store
            .agents
            .insert(("agents".into(), "a".into()), agent(&["dev-*", "staging"]));

        let t = task(
            "prod",
            TaskSpec {
                agent_ref: Some(AgentReference {
                    name: "a".to_string(),
                    namespace: Some("agents".to_string()),
                }),
                ..Default::default()
            },
        );

        match resolve(&store, &t, None).await {
            Err(Error::Rejected(r)) => {
                assert_eq!(r.reason, REASON_AGENT_ERROR);
                assert!(r.message.contains("prod"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_missing_template_is_template_error() {
        let store = Store::default();
        let t = task(
            "dev",
            TaskSpec {
                task_template_ref: Some(TemplateReference {
                    name: "gone".to_string(),
                    namespace: None,
                }),
                ..Default::default()
            },
        );

        match resolve(&store, &t, None).await {
            Err(Error::Rejected(r)) => assert_eq!(r.reason, REASON_TEMPLATE_ERROR),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frozen_reference_is_not_rederived() {
        let mut store = Store::default();
        store.agents.insert(("agents".into(), "old".into()), agent(&[]));

        // The Task spec now points at an agent that doesn't exist; the frozen ref wins.
        let t = task(
            "dev",
            TaskSpec {
                agent_ref: Some(AgentReference {
                    name: "new".to_string(),
                    namespace: None,
                }),
                ..Default::default()
            },
        );
        let frozen = ResolvedAgentRef {
            namespace: "agents".to_string(),
            name: "old".to_string(),
        };

        let resolution = resolve(&store, &t, Some(&frozen)).await.unwrap();
        assert_eq!(resolution.agent_ref, frozen);
    }

    #[tokio::test]
    async fn test_frozen_reference_survives_deleted_template() {
        let mut store = Store::default();
        store.agents.insert(("agents".into(), "coder".into()), agent(&[]));
        let t = task(
            "dev",
            TaskSpec {
                task_template_ref: Some(TemplateReference {
                    name: "deleted".to_string(),
                    namespace: None,
                }),
                ..Default::default()
            },
        );
        let frozen = ResolvedAgentRef {
            namespace: "agents".to_string(),
            name: "coder".to_string(),
        };

        let resolution = resolve(&store, &t, Some(&frozen)).await.unwrap();
        assert_eq!(resolution.agent_ref, frozen);
        assert!(resolution.template.is_none());

        // Before the reference is frozen the template is still required
        assert!(matches!(
            resolve(&store, &t, None).await,
            Err(Error::Rejected(r)) if r.reason == REASON_TEMPLATE_ERROR
        ));
    }

    #[tokio::test]
    async fn test_agent_without_service_account_is_rejected() {
        let mut store = Store::default();
        let mut a = agent(&[]);
        a.spec.service_account_name = String::new();
        store.agents.insert(("dev".into(), "default".into()), a);

        let t = task("dev", TaskSpec::default());
        assert!(matches!(
            resolve(&store, &t, None).await,
            Err(Error::Rejected(_))
        ));
    }
}
