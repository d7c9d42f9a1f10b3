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

//! Watch streams feeding Task keys into the runtime

use crate::crds::Task;
use crate::tasks::labels::{APP_LABEL, APP_LABEL_VALUE, TASK_LABEL, TASK_NAMESPACE_LABEL};
use crate::tasks::runtime::EventSender;
use crate::tasks::types::TaskKey;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Task a workload pod belongs to, from the labels the builder put on it
#[must_use]
pub fn pod_task_key(pod: &Pod) -> Option<TaskKey> {
    let labels = pod.labels();
    if labels.get(APP_LABEL).map(String::as_str) != Some(APP_LABEL_VALUE) {
        return None;
    }
    let name = labels.get(TASK_LABEL)?;
    let namespace = labels.get(TASK_NAMESPACE_LABEL)?;
    Some(TaskKey::new(namespace.clone(), name.clone()))
}

/// Keys touched by one watch event
fn event_keys<K>(event: &Event<K>, key_of: impl Fn(&K) -> Option<TaskKey>) -> Vec<TaskKey> {
    match event {
        Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => {
            key_of(obj).into_iter().collect()
        }
        Event::Init | Event::InitDone => Vec::new(),
    }
}

async fn pump<K, S>(
    kind: &'static str,
    stream: S,
    key_of: impl Fn(&K) -> Option<TaskKey>,
    sender: EventSender,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    info!(kind, "👀 Watching");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    for key in event_keys(&event, &key_of) {
                        debug!(kind, task = %key, "Watch event");
                        if !sender.enqueue(key) {
                            return;
                        }
                    }
                }
                Some(Err(e)) => warn!(kind, error = %e, "Watch error"),
                None => break,
            }
        }
    }
    info!(kind, "Watch stopped");
}

/// Watch Tasks, in one namespace or all of them
pub async fn watch_tasks(
    client: Client,
    namespace: Option<String>,
    sender: EventSender,
    shutdown: CancellationToken,
) {
    let api: Api<Task> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    pump("Task", stream, |task: &Task| TaskKey::from_task(task).ok(), sender, shutdown).await;
}

/// Watch workload pods in every namespace; they live in agent namespaces
pub async fn watch_pods(client: Client, sender: EventSender, shutdown: CancellationToken) {
    let api: Api<Pod> = Api::all(client);
    let config = watcher::Config::default().labels(&format!("{APP_LABEL}={APP_LABEL_VALUE}"));
    let stream = watcher(api, config).default_backoff();
    pump("Pod", stream, pod_task_key, sender, shutdown).await;
}
