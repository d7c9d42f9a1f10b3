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

use crate::tasks::admission::SystemClock;
use crate::tasks::backend::TaskStore;
use crate::tasks::kube_backend::KubeBackend;
use crate::tasks::runtime::{Runtime, RuntimeMetrics};
use crate::tasks::watch::{watch_pods, watch_tasks};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

pub mod admission;
pub mod backend;
pub mod config;
pub mod contexts;
pub mod kube_backend;
pub mod labels;
pub mod memory;
pub mod naming;
pub mod queue;
pub mod reconcile;
pub mod resolve;
pub mod runtime;
pub mod types;
pub mod watch;
pub mod workload;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use reconcile::Reconciler;
pub use types::{Context, Error, Result};

/// Main entry point for the Task controller
///
/// Runs until `shutdown` is cancelled. `metrics` is shared with the HTTP
/// server so `/metrics` reflects the live runtime.
#[instrument(skip_all, fields(namespace = ?config.watch.namespace))]
pub async fn run_task_controller(
    client: Client,
    config: Arc<ControllerConfig>,
    metrics: Arc<RuntimeMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }
    debug!("Configuration validation passed");

    let namespace = config.watch.namespace.clone();
    let backend = KubeBackend::new(client.clone(), namespace.clone());

    // Startup visibility: what the controller is about to pick up
    match backend.list_tasks().await {
        Ok(tasks) => {
            info!("Controller startup: found {} Task(s)", tasks.len());
            for task in &tasks {
                debug!(
                    "Existing Task: {}/{} phase='{}'",
                    task.namespace().unwrap_or_default(),
                    task.name_any(),
                    task.phase()
                );
            }
        }
        Err(e) => error!("Failed to list Tasks at startup: {}", e),
    }

    let context = Arc::new(Context {
        backend,
        clock: SystemClock,
        config: Arc::clone(&config),
    });
    let runtime = Runtime::new(Reconciler::new(context), metrics);

    let task_watch = tokio::spawn(watch_tasks(
        client.clone(),
        namespace,
        runtime.sender(),
        shutdown.clone(),
    ));
    let pod_watch = tokio::spawn(watch_pods(client, runtime.sender(), shutdown.clone()));

    info!("🚀 Task controller running");
    runtime.run(shutdown).await;

    for handle in [task_watch, pod_watch] {
        if let Err(e) = handle.await {
            error!("Watch task panicked: {}", e);
        }
    }
    info!("Task controller stopped");
    Ok(())
}
