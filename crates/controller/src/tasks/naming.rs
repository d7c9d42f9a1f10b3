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

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const POD_SUFFIX: &str = "-pod";
const CONTEXT_SUFFIX: &str = "-context";

pub struct ResourceNaming;

impl ResourceNaming {
    /// Workload pod name for a Task.
    ///
    /// Pods of cross-namespace Tasks run in the agent's namespace, so the Task
    /// namespace is folded into the name to keep it unique there.
    #[must_use]
    pub fn pod_name(task_namespace: &str, task_name: &str, workload_namespace: &str) -> String {
        let base = if task_namespace == workload_namespace {
            task_name.to_string()
        } else {
            format!("{task_namespace}-{task_name}")
        };
        let available = MAX_K8S_NAME_LENGTH.saturating_sub(POD_SUFFIX.len());
        format!("{}{POD_SUFFIX}", Self::ensure_k8s_name_length(&base, available))
    }

    /// `ConfigMap` holding the rendered context files for a pod
    #[must_use]
    pub fn context_config_map_name(pod_name: &str) -> String {
        let available = MAX_K8S_NAME_LENGTH.saturating_sub(CONTEXT_SUFFIX.len());
        format!(
            "{}{CONTEXT_SUFFIX}",
            Self::ensure_k8s_name_length(pod_name, available)
        )
    }

    // Keep a readable prefix and make the result unique with a hash of the full name
    fn ensure_k8s_name_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }

        let hash = Self::hash_string(name);
        let prefix_len = limit.saturating_sub(hash.len() + 1);
        let prefix: String = name.chars().take(prefix_len).collect();
        format!("{}-{hash}", prefix.trim_end_matches('-'))
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_namespace_pod_name() {
        assert_eq!(ResourceNaming::pod_name("dev", "fix-bug", "dev"), "fix-bug-pod");
    }

    #[test]
    fn test_cross_namespace_pod_name() {
        assert_eq!(
            ResourceNaming::pod_name("dev-team-a", "fix-bug", "agents"),
            "dev-team-a-fix-bug-pod"
        );
    }

    #[test]
    fn test_long_names_are_truncated_deterministically() {
        let long = "x".repeat(80);
        let first = ResourceNaming::pod_name("dev", &long, "dev");
        let second = ResourceNaming::pod_name("dev", &long, "dev");
        assert_eq!(first, second);
        assert!(first.len() <= 63);
        assert!(first.ends_with("-pod"));

        let other = ResourceNaming::pod_name("dev", &format!("{long}y"), "dev");
        assert_ne!(first, other);
    }

    #[test]
    fn test_context_config_map_name() {
        let cm = ResourceNaming::context_config_map_name("fix-bug-pod");
        assert_eq!(cm, "fix-bug-pod-context");
        let long = ResourceNaming::context_config_map_name(&"y".repeat(63));
        assert!(long.len() <= 63);
    }
}
