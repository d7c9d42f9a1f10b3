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

//! Event queue and worker pool driving the reconciler
//!
//! Keys arrive from watchers, requeue timers and resyncs. At most
//! `workers.maxConcurrentReconciles` reconciliations run at once and a key is
//! never reconciled concurrently with itself. Transient failures are retried
//! through the delay queue with exponential backoff, so a failing key never
//! sleeps while holding its lock or a worker slot.
//!
//! When a Task frees a running slot, its agent's waiters are drained one at a
//! time, oldest first, until one of them stays `Queued`.

use crate::crds::ResolvedAgentRef;
use crate::tasks::admission::Clock;
use crate::tasks::backend::Backend;
use crate::tasks::config::ControllerConfig;
use crate::tasks::reconcile::{mark_backend_unavailable, Outcome, Reconciler, Requeue};
use crate::tasks::types::TaskKey;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-key mutexes serializing work on the same Task (or agent)
pub struct KeyLocks<K = TaskKey> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash> Default for KeyLocks<K> {
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        mutex.lock_owned().await
    }

    /// Forget keys nobody holds or waits for
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Counters exposed on `/metrics`
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    reconciles: AtomicU64,
    errors: AtomicU64,
    retries_exhausted: AtomicU64,
    requeues: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub reconciles_total: u64,
    pub reconcile_errors_total: u64,
    pub retries_exhausted_total: u64,
    pub requeues_total: u64,
}

impl RuntimeMetrics {
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconciles_total: self.reconciles.load(Ordering::Relaxed),
            reconcile_errors_total: self.errors.load(Ordering::Relaxed),
            retries_exhausted_total: self.retries_exhausted.load(Ordering::Relaxed),
            requeues_total: self.requeues.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable entry point for anything that wants a Task looked at
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<TaskKey>,
}

impl EventSender {
    /// Returns false once the runtime has stopped
    pub fn enqueue(&self, key: TaskKey) -> bool {
        self.tx.send(key).is_ok()
    }
}

struct Shared<B, C> {
    reconciler: Reconciler<B, C>,
    config: Arc<ControllerConfig>,
    workers: Arc<Semaphore>,
    locks: KeyLocks,
    attempts: DashMap<TaskKey, u32>,
    metrics: Arc<RuntimeMetrics>,
    events: mpsc::UnboundedSender<TaskKey>,
    requeues: mpsc::UnboundedSender<(TaskKey, Duration)>,
}

pub struct Runtime<B, C> {
    shared: Arc<Shared<B, C>>,
    events_rx: mpsc::UnboundedReceiver<TaskKey>,
    requeues_rx: mpsc::UnboundedReceiver<(TaskKey, Duration)>,
}

impl<B, C> Runtime<B, C>
where
    B: Backend + 'static,
    C: Clock + 'static,
{
    #[must_use]
    pub fn new(reconciler: Reconciler<B, C>, metrics: Arc<RuntimeMetrics>) -> Self {
        let config = Arc::clone(&reconciler.context().config);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (requeues, requeues_rx) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(config.workers.max_concurrent_reconciles.max(1)));

        Self {
            shared: Arc::new(Shared {
                reconciler,
                config,
                workers,
                locks: KeyLocks::default(),
                attempts: DashMap::new(),
                metrics,
                events,
                requeues,
            }),
            events_rx,
            requeues_rx,
        }
    }

    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.shared.events.clone(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Process events until `shutdown` fires, then wait for in-flight work
    pub async fn run(mut self, shutdown: CancellationToken) {
        let config = Arc::clone(&self.shared.config);
        let mut timers: DelayQueue<TaskKey> = DelayQueue::new();
        let mut scheduled: HashMap<TaskKey, delay_queue::Key> = HashMap::new();
        let mut resync = tokio::time::interval(Duration::from_secs(
            config.queue.resync_interval_seconds.max(1),
        ));

        info!(
            workers = config.workers.max_concurrent_reconciles,
            resync_seconds = config.queue.resync_interval_seconds,
            "Task runtime started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(key) = self.events_rx.recv() => self.dispatch(key),
                Some((key, delay)) = self.requeues_rx.recv() => {
                    schedule(&mut timers, &mut scheduled, key, delay);
                }
                Some(expired) = timers.next() => {
                    let key = expired.into_inner();
                    scheduled.remove(&key);
                    self.dispatch(key);
                }
                _ = resync.tick() => self.resync(),
            }
        }

        info!("Task runtime stopping, waiting for in-flight reconciliations");
        let in_flight = u32::try_from(config.workers.max_concurrent_reconciles.max(1)).unwrap_or(u32::MAX);
        let _drained = self.shared.workers.acquire_many(in_flight).await;
    }

    fn resync(&self) {
        let shared = Arc::clone(&self.shared);
        shared.locks.prune();
        tokio::spawn(async move {
            match shared.reconciler.context().backend.list_tasks().await {
                Ok(tasks) => {
                    debug!(count = tasks.len(), "Resync");
                    for task in &tasks {
                        if let Ok(key) = TaskKey::from_task(task) {
                            let _ = shared.events.send(key);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Resync list failed"),
            }
        });
    }

    fn dispatch(&self, key: TaskKey) {
        let shared = Arc::clone(&self.shared);
        let span = info_span!("reconcile", task = %key);
        tokio::spawn(async move { process(shared, key).await }.instrument(span));
    }
}

fn schedule(
    timers: &mut DelayQueue<TaskKey>,
    scheduled: &mut HashMap<TaskKey, delay_queue::Key>,
    key: TaskKey,
    delay: Duration,
) {
    match scheduled.get(&key) {
        // Keep whichever deadline comes first
        Some(existing) => {
            let deadline = tokio::time::Instant::now() + delay;
            if deadline < timers.deadline(existing) {
                timers.reset_at(existing, deadline);
            }
        }
        None => {
            let timer = timers.insert(key.clone(), delay);
            scheduled.insert(key, timer);
        }
    }
}

async fn process<B, C>(shared: Arc<Shared<B, C>>, key: TaskKey)
where
    B: Backend + 'static,
    C: Clock + 'static,
{
    let Ok(permit) = Arc::clone(&shared.workers).acquire_owned().await else {
        return;
    };
    let outcome = reconcile_key(&shared, &key).await;
    drop(permit);

    if let Some(agent) = outcome.and_then(|o| o.freed_agent) {
        spawn_drain(shared, agent);
    }
}

/// Reconcile `key` under its lock and schedule whatever comes next for it.
/// Returns the outcome when the pass succeeded.
async fn reconcile_key<B, C>(shared: &Shared<B, C>, key: &TaskKey) -> Option<Outcome>
where
    B: Backend + 'static,
    C: Clock + 'static,
{
    let _guard = shared.locks.lock(key).await;
    shared.metrics.reconciles.fetch_add(1, Ordering::Relaxed);

    match shared.reconciler.reconcile(key).await {
        Ok(outcome) => {
            shared.attempts.remove(key);
            if let Requeue::After(delay) = outcome.requeue {
                shared.metrics.requeues.fetch_add(1, Ordering::Relaxed);
                let _ = shared.requeues.send((key.clone(), delay));
            }
            Some(outcome)
        }
        Err(e) if e.is_transient() => {
            shared.metrics.errors.fetch_add(1, Ordering::Relaxed);
            let attempt = {
                let mut entry = shared.attempts.entry(key.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let retry = &shared.config.retry;

            if attempt < retry.max_attempts {
                let delay = retry.backoff(attempt);
                warn!(error = %e, attempt, ?delay, "Transient failure, retrying");
                let _ = shared.requeues.send((key.clone(), delay));
            } else {
                error!(error = %e, attempt, "Retries exhausted, waiting for the next change");
                shared.attempts.remove(key);
                shared.metrics.retries_exhausted.fetch_add(1, Ordering::Relaxed);
                let context = shared.reconciler.context();
                let message = format!("Backend unavailable after {attempt} attempts: {e}");
                if let Err(e) =
                    mark_backend_unavailable(&context.backend, key, &message, context.clock.now())
                        .await
                {
                    debug!(error = %e, "Could not record backend failure");
                }
            }
            None
        }
        Err(e) => {
            shared.metrics.errors.fetch_add(1, Ordering::Relaxed);
            shared.attempts.remove(key);
            error!(error = %e, "Reconcile failed");
            None
        }
    }
}

/// Re-evaluate the waiters of `agent` oldest first, stopping at the first one
/// that is still waiting. Runs outside the lock of the Task that freed the slot.
fn spawn_drain<B, C>(shared: Arc<Shared<B, C>>, agent: ResolvedAgentRef)
where
    B: Backend + 'static,
    C: Clock + 'static,
{
    let span = info_span!("drain", %agent);
    tokio::spawn(
        async move {
            let waiting = match shared.reconciler.waiters(&agent).await {
                Ok(waiting) => waiting,
                // The waiters' own requeue timers still fire
                Err(e) => {
                    warn!(error = %e, "Could not list waiters");
                    return;
                }
            };
            if waiting.is_empty() {
                return;
            }
            debug!(waiting = waiting.len(), "Capacity freed, re-evaluating waiters");

            for waiter in waiting {
                let Ok(permit) = Arc::clone(&shared.workers).acquire_owned().await else {
                    return;
                };
                let outcome = reconcile_key(&shared, &waiter)
                    .instrument(info_span!("reconcile", task = %waiter))
                    .await;
                drop(permit);

                match outcome {
                    Some(outcome) if !outcome.waiting => {
                        if let Some(freed) = outcome.freed_agent {
                            spawn_drain(Arc::clone(&shared), freed);
                        }
                    }
                    _ => break,
                }
            }
        }
        .instrument(span),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::default());
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicU64::new(0));
        let key = TaskKey::new("dev", "t");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (locks, busy, overlaps, key) =
                (locks.clone(), busy.clone(), overlaps.clone(), key.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
                if busy.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                busy.store(false, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLocks::default();
        let _a = locks.lock(&TaskKey::new("dev", "a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&TaskKey::new("dev", "b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = KeyLocks::default();
        let held = locks.lock(&TaskKey::new("dev", "held")).await;
        drop(locks.lock(&TaskKey::new("dev", "released")).await);

        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_keeps_earliest_deadline() {
        let mut timers = DelayQueue::new();
        let mut scheduled = HashMap::new();
        let key = TaskKey::new("dev", "t");

        schedule(&mut timers, &mut scheduled, key.clone(), Duration::from_secs(60));
        schedule(&mut timers, &mut scheduled, key.clone(), Duration::from_secs(5));
        schedule(&mut timers, &mut scheduled, key.clone(), Duration::from_secs(30));
        assert_eq!(timers.len(), 1);

        let expired = tokio::time::timeout(Duration::from_secs(6), timers.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.into_inner(), key);
    }
}
