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

//! Admission behaviour across several Tasks sharing one Agent

mod common;

use common::{agent, task, Harness};
use std::time::Duration;
use task_controller::crds::{AgentReference, QuotaConfig, ResolvedAgentRef, TaskPhase};
use task_controller::tasks::labels::{
    AGENT_LABEL, CONDITION_QUEUED, CONDITION_READY, CONDITION_SUCCEEDED, REASON_AGENT_ERROR,
    REASON_AT_CAPACITY, REASON_QUOTA_EXCEEDED,
};
use task_controller::tasks::reconcile::Requeue;
use task_controller::tasks::types::TaskKey;

fn coder() -> ResolvedAgentRef {
    ResolvedAgentRef {
        namespace: "dev".to_string(),
        name: "coder".to_string(),
    }
}

#[tokio::test]
async fn test_concurrency_cap_queues_overflow_in_creation_order() {
    let h = Harness::new();
    h.backend.insert_agent("dev", "coder", agent(Some(3)));
    let keys: Vec<TaskKey> = (1..=5)
        .map(|i| h.backend.insert_task(task("dev", &format!("t{i}"), "coder")))
        .collect();

    for key in &keys {
        h.reconcile(key).await;
    }

    let phases: Vec<TaskPhase> = keys.iter().map(|k| h.phase(k)).collect();
    assert_eq!(
        phases,
        vec![
            TaskPhase::Running,
            TaskPhase::Running,
            TaskPhase::Running,
            TaskPhase::Queued,
            TaskPhase::Queued
        ]
    );
    assert_eq!(h.backend.pod_count(), 3);
    assert_eq!(
        h.condition_reason(&keys[3], CONDITION_QUEUED).as_deref(),
        Some(REASON_AT_CAPACITY)
    );
    assert_eq!(
        h.condition_status(&keys[3], CONDITION_READY).as_deref(),
        Some("False")
    );

    // Re-reconciling a queued Task while still full changes nothing
    let outcome = h.reconcile(&keys[4]).await;
    assert!(matches!(outcome.requeue, Requeue::After(_)));
    assert_eq!(h.phase(&keys[4]), TaskPhase::Queued);

    // First Task finishes and frees its slot
    assert!(h.backend.set_pod_phase("dev", "t1-pod", "Succeeded"));
    let outcome = h.reconcile(&keys[0]).await;
    assert_eq!(h.phase(&keys[0]), TaskPhase::Completed);
    assert_eq!(outcome.freed_agent, Some(coder()));

    let waiters = h.reconciler.waiters(&coder()).await.unwrap();
    assert_eq!(waiters, vec![keys[3].clone(), keys[4].clone()]);
    for key in &waiters {
        h.reconcile(key).await;
    }

    assert_eq!(h.phase(&keys[3]), TaskPhase::Running);
    assert_eq!(h.phase(&keys[4]), TaskPhase::Queued);
    assert_eq!(h.backend.pod_count(), 4);
}

#[tokio::test]
async fn test_unlimited_agent_admits_everything() {
    let h = Harness::new();
    h.backend.insert_agent("dev", "coder", agent(Some(0)));
    for i in 0..6 {
        let key = h.backend.insert_task(task("dev", &format!("t{i}"), "coder"));
        h.reconcile(&key).await;
        assert_eq!(h.phase(&key), TaskPhase::Running);
    }
}

#[tokio::test]
async fn test_quota_window_slides() {
    let h = Harness::new();
    let mut spec = agent(None);
    spec.quota = Some(QuotaConfig {
        max_task_starts: 1,
        window_seconds: 60,
    });
    h.backend.insert_agent("dev", "coder", spec);

    let first = h.backend.insert_task(task("dev", "first", "coder"));
    h.reconcile(&first).await;
    assert_eq!(h.phase(&first), TaskPhase::Running);

    // Completion does not give the start back
    h.backend.set_pod_phase("dev", "first-pod", "Succeeded");
    h.reconcile(&first).await;
    assert_eq!(h.phase(&first), TaskPhase::Completed);

    let second = h.backend.insert_task(task("dev", "second", "coder"));
    let outcome = h.reconcile(&second).await;
    assert_eq!(h.phase(&second), TaskPhase::Queued);
    assert_eq!(
        h.condition_reason(&second, CONDITION_QUEUED).as_deref(),
        Some(REASON_QUOTA_EXCEEDED)
    );
    assert_eq!(outcome.requeue, Requeue::After(Duration::from_secs(61)));

    h.clock.advance(Duration::from_secs(30));
    h.reconcile(&second).await;
    assert_eq!(h.phase(&second), TaskPhase::Queued);

    h.clock.advance(Duration::from_secs(30));
    h.reconcile(&second).await;
    assert_eq!(h.phase(&second), TaskPhase::Running);
}

#[tokio::test]
async fn test_quota_of_two_per_minute() {
    let h = Harness::new();
    let mut spec = agent(None);
    spec.quota = Some(QuotaConfig {
        max_task_starts: 2,
        window_seconds: 60,
    });
    h.backend.insert_agent("dev", "coder", spec);

    // Starts at t=0s and t=20s fill the window
    let first = h.backend.insert_task(task("dev", "first", "coder"));
    h.reconcile(&first).await;
    h.clock.advance(Duration::from_secs(20));
    let second = h.backend.insert_task(task("dev", "second", "coder"));
    h.reconcile(&second).await;
    assert_eq!(h.phase(&first), TaskPhase::Running);
    assert_eq!(h.phase(&second), TaskPhase::Running);

    h.clock.advance(Duration::from_secs(10));
    let third = h.backend.insert_task(task("dev", "third", "coder"));
    let outcome = h.reconcile(&third).await;
    assert_eq!(h.phase(&third), TaskPhase::Queued);
    assert_eq!(
        h.condition_reason(&third, CONDITION_QUEUED).as_deref(),
        Some(REASON_QUOTA_EXCEEDED)
    );
    // The t=0s start leaves the window at t=60s
    assert_eq!(outcome.requeue, Requeue::After(Duration::from_secs(31)));
    assert!(outcome.waiting);

    h.clock.advance(Duration::from_secs(29));
    h.reconcile(&third).await;
    assert_eq!(h.phase(&third), TaskPhase::Queued);

    h.clock.advance(Duration::from_secs(1));
    h.reconcile(&third).await;
    assert_eq!(h.phase(&third), TaskPhase::Running);

    // Now t=20s and t=60s are in the window
    let fourth = h.backend.insert_task(task("dev", "fourth", "coder"));
    h.reconcile(&fourth).await;
    assert_eq!(h.phase(&fourth), TaskPhase::Queued);
}

#[tokio::test]
async fn test_deleted_task_no_longer_counts_against_quota() {
    let h = Harness::new();
    let mut spec = agent(None);
    spec.quota = Some(QuotaConfig {
        max_task_starts: 1,
        window_seconds: 3600,
    });
    h.backend.insert_agent("dev", "coder", spec);

    let first = h.backend.insert_task(task("dev", "first", "coder"));
    h.reconcile(&first).await;
    let second = h.backend.insert_task(task("dev", "second", "coder"));
    h.reconcile(&second).await;
    assert_eq!(h.phase(&second), TaskPhase::Queued);

    // Starts are counted from the Tasks that still exist
    h.backend.delete_task(&first);
    h.reconcile(&first).await;
    assert!(h.backend.task(&first).is_none());

    h.reconcile(&second).await;
    assert_eq!(h.phase(&second), TaskPhase::Running);
}

#[tokio::test]
async fn test_concurrency_gate_reported_before_quota() {
    let h = Harness::new();
    let mut spec = agent(Some(1));
    spec.quota = Some(QuotaConfig {
        max_task_starts: 1,
        window_seconds: 3600,
    });
    h.backend.insert_agent("dev", "coder", spec);

    let first = h.backend.insert_task(task("dev", "first", "coder"));
    let second = h.backend.insert_task(task("dev", "second", "coder"));
    h.reconcile(&first).await;
    h.reconcile(&second).await;

    assert_eq!(
        h.condition_reason(&second, CONDITION_QUEUED).as_deref(),
        Some(REASON_AT_CAPACITY)
    );
}

#[tokio::test]
async fn test_namespace_allow_list() {
    let h = Harness::new();
    let mut spec = agent(None);
    spec.allowed_namespaces = vec!["team-*".to_string()];
    h.backend.insert_agent("platform", "shared", spec);

    let mut outsider = task("sandbox", "t", "shared");
    outsider.spec.agent_ref = Some(AgentReference {
        name: "shared".to_string(),
        namespace: Some("platform".to_string()),
    });
    let mut member = outsider.clone();
    member.metadata.namespace = Some("team-a".to_string());

    let outsider = h.backend.insert_task(outsider);
    let member = h.backend.insert_task(member);
    h.reconcile(&outsider).await;
    h.reconcile(&member).await;

    assert_eq!(h.phase(&outsider), TaskPhase::Completed);
    assert_eq!(
        h.condition_reason(&outsider, CONDITION_SUCCEEDED).as_deref(),
        Some(REASON_AGENT_ERROR)
    );
    assert_eq!(
        h.condition_status(&outsider, CONDITION_READY).as_deref(),
        Some("False")
    );

    // Cross-namespace workloads run next to the Agent, without owner references
    assert_eq!(h.phase(&member), TaskPhase::Running);
    let pod = h.backend.pod("platform", "team-a-t-pod").unwrap();
    assert!(pod.metadata.owner_references.is_none());
    let status = h.status(&member);
    assert_eq!(status.pod_namespace.as_deref(), Some("platform"));
}

#[tokio::test]
async fn test_agent_reference_frozen_while_queued() {
    let h = Harness::new();
    h.backend.insert_agent("dev", "coder", agent(Some(1)));
    h.backend.insert_agent("dev", "reviewer", agent(None));

    let blocker = h.backend.insert_task(task("dev", "blocker", "coder"));
    let waiting = h.backend.insert_task(task("dev", "waiting", "coder"));
    h.reconcile(&blocker).await;
    h.reconcile(&waiting).await;
    assert_eq!(h.phase(&waiting), TaskPhase::Queued);

    // Retargeting the Task after it was queued has no effect
    let mut edited = h.backend.task(&waiting).unwrap();
    edited.spec.agent_ref = Some(AgentReference {
        name: "reviewer".to_string(),
        namespace: None,
    });
    h.backend.insert_task(edited);
    h.reconcile(&waiting).await;
    assert_eq!(h.phase(&waiting), TaskPhase::Queued);

    h.backend.set_pod_phase("dev", "blocker-pod", "Succeeded");
    h.reconcile(&blocker).await;
    h.reconcile(&waiting).await;

    let task = h.backend.task(&waiting).unwrap();
    assert_eq!(h.phase(&waiting), TaskPhase::Running);
    assert_eq!(task.resolved_agent(), Some(&coder()));
    assert_eq!(
        task.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(AGENT_LABEL))
            .map(String::as_str),
        Some("coder")
    );
}

#[tokio::test]
async fn test_default_agent_used_without_references() {
    let h = Harness::new();
    h.backend.insert_agent("dev", "default", agent(None));
    let mut bare = task("dev", "bare", "unused");
    bare.spec.agent_ref = None;
    let key = h.backend.insert_task(bare);

    h.reconcile(&key).await;
    assert_eq!(h.phase(&key), TaskPhase::Running);
    assert_eq!(
        h.status(&key).agent_ref.map(|a| a.name),
        Some("default".to_string())
    );
}
