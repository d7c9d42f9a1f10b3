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

//! Admission gates: per-agent concurrency cap, then sliding-window start quota.
//!
//! Decisions are computed from a sibling snapshot that may be stale. Two
//! Tasks racing for the last slot in different controller processes can both
//! be admitted; the caps are soft.
//!
//! The quota window is reconstructed from the `startTime` of sibling Tasks
//! that still exist. Deleting a Task gives its start back early; there is no
//! separate start ledger.

use crate::crds::{AgentSpec, ResolvedAgentRef, Task, TaskPhase};
use crate::tasks::labels::{REASON_AT_CAPACITY, REASON_QUOTA_EXCEEDED};
use crate::tasks::types::TaskKey;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::ResourceExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Source of "now"; injectable so quota windows can be tested
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += ChronoDuration::from_std(by).unwrap_or(ChronoDuration::MAX);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// What admission needs to know about one sibling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingTask {
    pub key: TaskKey,
    pub phase: TaskPhase,
    pub start_time: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

impl SiblingTask {
    /// Snapshot entry for a Task, if it references `agent`.
    ///
    /// Tasks are matched on the frozen reference in status, so a stale label
    /// never pulls in a Task that belongs to another agent.
    #[must_use]
    pub fn from_task(task: &Task, agent: &ResolvedAgentRef) -> Option<Self> {
        if task.resolved_agent() != Some(agent) {
            return None;
        }
        let key = TaskKey::from_task(task).ok()?;
        Some(Self {
            key,
            phase: task.phase(),
            start_time: task.start_time().and_then(parse_time),
            created: task.creation_timestamp().map(|t| t.0),
        })
    }
}

pub(crate) fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Outcome of admission for one Task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny {
        reason: &'static str,
        message: String,
        /// When re-evaluation can succeed without any other event
        retry_after: Option<Duration>,
    },
}

impl Decision {
    #[must_use]
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Decision::Admit => None,
            Decision::Deny { reason, .. } => Some(*reason),
        }
    }
}

/// Count siblings other than `this` that are currently running
#[must_use]
pub fn running_count(this: &TaskKey, siblings: &[SiblingTask]) -> usize {
    siblings
        .iter()
        .filter(|s| &s.key != this && s.phase == TaskPhase::Running)
        .count()
}

/// Start times of siblings other than `this` inside `(now - window, now]`.
/// Only Tasks present in the snapshot are seen.
#[must_use]
pub fn starts_in_window(
    this: &TaskKey,
    siblings: &[SiblingTask],
    now: DateTime<Utc>,
    window: ChronoDuration,
) -> Vec<DateTime<Utc>> {
    let cutoff = now - window;
    let mut starts: Vec<_> = siblings
        .iter()
        .filter(|s| &s.key != this)
        .filter_map(|s| s.start_time)
        .filter(|start| *start > cutoff && *start <= now)
        .collect();
    starts.sort();
    starts
}

/// Run the concurrency gate, then the quota gate. The first failing gate wins.
#[must_use]
pub fn admit(
    agent: &AgentSpec,
    this: &TaskKey,
    siblings: &[SiblingTask],
    now: DateTime<Utc>,
) -> Decision {
    if let Some(cap) = agent.concurrency_limit() {
        let running = running_count(this, siblings);
        if running >= cap {
            return Decision::Deny {
                reason: REASON_AT_CAPACITY,
                message: format!("Agent at capacity ({running}/{cap} running)"),
                retry_after: None,
            };
        }
    }

    if let Some(quota) = agent.quota.as_ref() {
        if quota.window_seconds > 0 {
            let max = usize::try_from(quota.max_task_starts.max(0)).unwrap_or(0);
            let window = ChronoDuration::seconds(quota.window_seconds);
            let starts = starts_in_window(this, siblings, now, window);

            if starts.len() >= max {
                // The slot frees up when enough of the oldest starts leave the window.
                let retry_after = starts
                    .get(starts.len() - max)
                    .or_else(|| starts.first())
                    .and_then(|freeing| (*freeing + window - now).to_std().ok());

                return Decision::Deny {
                    reason: REASON_QUOTA_EXCEEDED,
                    message: format!(
                        "Quota exceeded ({}/{} starts in the last {}s)",
                        starts.len(),
                        quota.max_task_starts,
                        quota.window_seconds
                    ),
                    retry_after,
                };
            }
        }
    }

    Decision::Admit
}
