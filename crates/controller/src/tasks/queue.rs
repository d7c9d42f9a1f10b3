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

//! Approximate-FIFO ordering for Tasks waiting on an agent
//!
//! There is no queue data structure to keep consistent: waiting Tasks sit in
//! `Queued` and are re-evaluated, oldest first, whenever a sibling frees
//! capacity or a requeue timer fires. Each re-evaluation runs full admission.

use crate::crds::TaskPhase;
use crate::tasks::admission::{Decision, SiblingTask};
use crate::tasks::config::QueueConfig;
use crate::tasks::types::TaskKey;
use std::cmp::Ordering;
use std::time::Duration;

/// Oldest first; ties (and missing timestamps, which sort last) broken by key
#[must_use]
pub fn fifo_cmp(a: &SiblingTask, b: &SiblingTask) -> Ordering {
    match (a.created, b.created) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.key.cmp(&b.key))
}

/// Sort a snapshot into admission order
pub fn fifo_order(tasks: &mut [SiblingTask]) {
    tasks.sort_by(fifo_cmp);
}

/// Queued siblings, in the order they should be re-evaluated
#[must_use]
pub fn waiters(siblings: &[SiblingTask]) -> Vec<TaskKey> {
    let mut queued: Vec<SiblingTask> = siblings
        .iter()
        .filter(|s| s.phase == TaskPhase::Queued)
        .cloned()
        .collect();
    fifo_order(&mut queued);
    queued.into_iter().map(|s| s.key).collect()
}

/// How long a denied Task waits before it is evaluated again on its own.
///
/// Quota denials know exactly when the window slides far enough; concurrency
/// denials fall back to the configured delay (capacity-freeing events usually
/// come sooner).
#[must_use]
pub fn requeue_delay(decision: &Decision, config: &QueueConfig) -> Duration {
    let fallback = Duration::from_secs(config.requeue_delay_seconds);
    match decision {
        Decision::Admit => fallback,
        Decision::Deny {
            retry_after: Some(after),
            ..
        } => (*after + Duration::from_secs(1)).max(Duration::from_secs(1)),
        Decision::Deny {
            retry_after: None, ..
        } => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::labels::{REASON_AT_CAPACITY, REASON_QUOTA_EXCEEDED};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn sibling(name: &str, phase: TaskPhase, created_offset: Option<i64>) -> SiblingTask {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        SiblingTask {
            key: TaskKey::new("dev", name),
            phase,
            start_time: None,
            created: created_offset.map(|s| base + ChronoDuration::seconds(s)),
        }
    }

    #[test]
    fn test_waiters_oldest_first_with_name_tiebreak() {
        let siblings = vec![
            sibling("late", TaskPhase::Queued, Some(30)),
            sibling("b-same", TaskPhase::Queued, Some(10)),
            sibling("a-same", TaskPhase::Queued, Some(10)),
            sibling("running", TaskPhase::Running, Some(0)),
            sibling("unknown", TaskPhase::Queued, None),
        ];

        let order: Vec<_> = waiters(&siblings).into_iter().map(|k| k.name).collect();
        assert_eq!(order, vec!["a-same", "b-same", "late", "unknown"]);
    }

    #[test]
    fn test_requeue_delay() {
        let config = QueueConfig::default();
        let capacity = Decision::Deny {
            reason: REASON_AT_CAPACITY,
            message: String::new(),
            retry_after: None,
        };
        assert_eq!(requeue_delay(&capacity, &config), Duration::from_secs(10));

        let quota = Decision::Deny {
            reason: REASON_QUOTA_EXCEEDED,
            message: String::new(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(requeue_delay(&quota, &config), Duration::from_secs(31));
    }
}
