// Copyright 2025 Fleetscale Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-producer, many-consumer fan-out of per-group work. The producer
//! is leader-guarded by the job-creation lock; consumers pop jobs with a
//! wall-clock timeout and zero retries, since the next producer interval
//! recreates whatever failed.

mod queue;

use std::sync::Arc;
use std::time::Duration;

pub use queue::*;
use tokio::sync::oneshot::Sender;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::AutoscalerResult;
use crate::manager::{AutoscalerEnv, InstanceGroupManagerRef};
use crate::monitor::SanityLoop;
use crate::scaler::{AutoscaleProcessorRef, InstanceLauncherRef};
use crate::storage;
use crate::storage::RedisStore;

/// How often an idle consumer polls its queue.
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct JobQueues {
    autoscaler: JobQueueRef,
    launcher: JobQueueRef,
    sanity: JobQueueRef,
}

impl JobQueues {
    pub fn in_memory() -> Self {
        Self {
            autoscaler: Arc::new(MemJobQueue::new()),
            launcher: Arc::new(MemJobQueue::new()),
            sanity: Arc::new(MemJobQueue::new()),
        }
    }

    pub fn redis(store: &RedisStore) -> Self {
        Self {
            autoscaler: Arc::new(RedisJobQueue::new(store, JobKind::Autoscaler)),
            launcher: Arc::new(RedisJobQueue::new(store, JobKind::Launcher)),
            sanity: Arc::new(RedisJobQueue::new(store, JobKind::Sanity)),
        }
    }

    fn queue(&self, kind: JobKind) -> &JobQueueRef {
        match kind {
            JobKind::Autoscaler => &self.autoscaler,
            JobKind::Launcher => &self.launcher,
            JobKind::Sanity => &self.sanity,
        }
    }
}

pub type JobManagerRef = Arc<JobManager>;

pub struct JobManager {
    env: AutoscalerEnv,
    group_manager: InstanceGroupManagerRef,
    queues: JobQueues,
    processor: AutoscaleProcessorRef,
    launcher: InstanceLauncherRef,
    sanity: Arc<SanityLoop>,
}

impl JobManager {
    pub fn new(
        env: AutoscalerEnv,
        group_manager: InstanceGroupManagerRef,
        queues: JobQueues,
        processor: AutoscaleProcessorRef,
        launcher: InstanceLauncherRef,
        sanity: Arc<SanityLoop>,
    ) -> Self {
        Self {
            env,
            group_manager,
            queues,
            processor,
            launcher,
            sanity,
        }
    }

    /// The leader-elected production loop: on each interval, try to fan
    /// out group jobs and sanity jobs, each pass guarded by its own grace
    /// key and the global job-creation lock.
    pub fn start_producer(self: &Arc<Self>) -> (JoinHandle<()>, Sender<()>) {
        let manager = self.clone();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.env.opts().autoscaler_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {},
                    _ = &mut shutdown_rx => {
                        tracing::info!("Job producer is stopped");
                        return;
                    }
                }
                if let Err(e) = manager.produce_group_jobs().await {
                    tracing::warn!("group job production failed: {}", e);
                }
                if let Err(e) = manager.produce_sanity_jobs().await {
                    tracing::warn!("sanity job production failed: {}", e);
                }
                manager.refresh_queue_gauges().await;
            }
        });
        (join_handle, shutdown_tx)
    }

    /// One production pass of autoscaler and launcher jobs. Returns false
    /// when the pass was skipped (grace period or another producer).
    pub async fn produce_group_jobs(&self) -> AutoscalerResult<bool> {
        if !self.group_manager.is_group_jobs_creation_allowed().await? {
            return Ok(false);
        }
        let lock = match self.env.lock_manager().lock_job_creation().await {
            Ok(lock) => lock,
            Err(storage::Error::LockUnavailable(_)) => {
                tracing::debug!("another replica is producing jobs");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let result = self.produce_group_jobs_locked().await;
        lock.release().await;
        result
    }

    async fn produce_group_jobs_locked(&self) -> AutoscalerResult<bool> {
        // Re-check inside the lock: another replica may have produced
        // between our gate check and the acquisition.
        if !self.group_manager.is_group_jobs_creation_allowed().await? {
            return Ok(false);
        }
        let mut produced = 0;
        for group in self.schedulable_groups().await? {
            self.queues
                .queue(JobKind::Autoscaler)
                .push(Job {
                    kind: JobKind::Autoscaler,
                    group_name: group.clone(),
                })
                .await?;
            self.queues
                .queue(JobKind::Launcher)
                .push(Job {
                    kind: JobKind::Launcher,
                    group_name: group,
                })
                .await?;
            produced += 2;
        }
        self.group_manager.set_group_jobs_creation_grace_period().await?;
        tracing::info!("produced {} group job(s)", produced);
        Ok(true)
    }

    pub async fn produce_sanity_jobs(&self) -> AutoscalerResult<bool> {
        if !self.group_manager.is_sanity_jobs_creation_allowed().await? {
            return Ok(false);
        }
        let lock = match self.env.lock_manager().lock_job_creation().await {
            Ok(lock) => lock,
            Err(storage::Error::LockUnavailable(_)) => {
                tracing::debug!("another replica is producing sanity jobs");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let result = self.produce_sanity_jobs_locked().await;
        lock.release().await;
        result
    }

    async fn produce_sanity_jobs_locked(&self) -> AutoscalerResult<bool> {
        if !self.group_manager.is_sanity_jobs_creation_allowed().await? {
            return Ok(false);
        }
        for group in self.schedulable_groups().await? {
            self.queues
                .queue(JobKind::Sanity)
                .push(Job {
                    kind: JobKind::Sanity,
                    group_name: group,
                })
                .await?;
        }
        self.group_manager.set_sanity_jobs_creation_grace_period().await?;
        Ok(true)
    }

    async fn schedulable_groups(&self) -> AutoscalerResult<Vec<String>> {
        Ok(self
            .group_manager
            .get_all_instance_groups()
            .await?
            .into_iter()
            .filter(|group| group.enable_scheduler)
            .map(|group| group.name)
            .collect())
    }

    /// Spawn the consumer workers: `consumers_per_queue` per job kind.
    pub fn start_consumers(self: &Arc<Self>) -> Vec<(JoinHandle<()>, Sender<()>)> {
        let mut handles = Vec::new();
        for kind in JobKind::all() {
            for _ in 0..self.env.opts().consumers_per_queue {
                let manager = self.clone();
                let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
                let join_handle = tokio::spawn(async move {
                    loop {
                        let job = match manager.queues.queue(kind).pop().await {
                            Ok(job) => job,
                            Err(e) => {
                                tracing::warn!("failed to pop {} job: {}", kind.as_str(), e);
                                None
                            }
                        };
                        match job {
                            Some(job) => {
                                manager.run_job(&job).await;
                            }
                            None => {
                                tokio::select! {
                                    _ = tokio::time::sleep(CONSUMER_POLL_INTERVAL) => {},
                                    _ = &mut shutdown_rx => {
                                        tracing::info!("{} consumer is stopped", kind.as_str());
                                        return;
                                    }
                                }
                            }
                        }
                    }
                });
                handles.push((join_handle, shutdown_tx));
            }
        }
        handles
    }

    /// Run one job to completion under its wall-clock timeout. Failures
    /// and timeouts are logged and dropped; the next producer cycle
    /// creates a fresh job.
    pub async fn run_job(&self, job: &Job) -> bool {
        let opts = self.env.opts();
        let timeout = match job.kind {
            JobKind::Autoscaler => opts.autoscaler_processing_timeout,
            JobKind::Launcher => opts.launcher_processing_timeout,
            JobKind::Sanity => opts.sanity_loop_processing_timeout,
        };
        let span = tracing::info_span!(
            "job",
            kind = job.kind.as_str(),
            group = job.group_name.as_str()
        );
        let handler = async {
            match job.kind {
                JobKind::Autoscaler => {
                    self.processor
                        .process_autoscaling_by_group(&job.group_name)
                        .await
                }
                JobKind::Launcher => {
                    self.launcher
                        .launch_or_shutdown_instances_by_group(&job.group_name)
                        .await
                }
                JobKind::Sanity => self.sanity.report_untracked_instances(&job.group_name).await,
            }
        };
        match tokio::time::timeout(timeout, handler.instrument(span)).await {
            Ok(Ok(processed)) => {
                tracing::debug!(
                    "{} job for group {} finished (processed: {})",
                    job.kind.as_str(),
                    job.group_name,
                    processed
                );
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    "{} job for group {} failed: {}",
                    job.kind.as_str(),
                    job.group_name,
                    e
                );
                false
            }
            Err(_) => {
                tracing::warn!(
                    "{} job for group {} timed out after {:?}",
                    job.kind.as_str(),
                    job.group_name,
                    timeout
                );
                false
            }
        }
    }

    async fn refresh_queue_gauges(&self) {
        for kind in JobKind::all() {
            if let Ok(len) = self.queues.queue(kind).len().await {
                self.env
                    .metrics()
                    .queue_waiting
                    .with_label_values(&[kind.as_str()])
                    .set(len as i64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Audit;
    use crate::cloud::{CloudManager, SimulatedCloudManager};
    use crate::manager::{InstanceGroupManager, InstanceTracker, ShutdownManager};
    use crate::model::GroupType;
    use crate::scaler::{AutoscaleProcessor, InstanceLauncher};
    use crate::test_utils::test_group;

    fn manager() -> (AutoscalerEnv, Arc<JobManager>, InstanceGroupManagerRef) {
        let env = AutoscalerEnv::for_test();
        let audit = Arc::new(Audit::new(&env));
        let shutdown_manager = Arc::new(ShutdownManager::new(env.clone(), audit.clone()));
        let tracker = Arc::new(InstanceTracker::new(
            env.clone(),
            shutdown_manager.clone(),
            audit.clone(),
        ));
        let group_manager = Arc::new(InstanceGroupManager::new(env.clone()));
        let sim = Arc::new(SimulatedCloudManager::new());
        let cloud_manager = Arc::new(CloudManager::new().with_adapter("sim", sim));
        let processor = Arc::new(AutoscaleProcessor::new(
            env.clone(),
            tracker.clone(),
            group_manager.clone(),
            audit.clone(),
        ));
        let launcher = Arc::new(InstanceLauncher::new(
            env.clone(),
            tracker.clone(),
            group_manager.clone(),
            shutdown_manager,
            audit,
            cloud_manager.clone(),
        ));
        let sanity = Arc::new(SanityLoop::new(
            env.clone(),
            tracker,
            group_manager.clone(),
            cloud_manager,
        ));
        let manager = Arc::new(JobManager::new(
            env.clone(),
            group_manager.clone(),
            JobQueues::in_memory(),
            processor,
            launcher,
            sanity,
        ));
        (env, manager, group_manager)
    }

    #[tokio::test]
    async fn test_producer_fans_out_per_group() {
        let (_, manager, group_manager) = manager();
        for name in ["bridges", "gateways"] {
            group_manager
                .upsert_instance_group(test_group(name, GroupType::Bridge))
                .await
                .unwrap();
        }
        let mut unscheduled = test_group("parked", GroupType::Bridge);
        unscheduled.enable_scheduler = false;
        group_manager.upsert_instance_group(unscheduled).await.unwrap();

        assert!(manager.produce_group_jobs().await.unwrap());
        assert!(manager.produce_sanity_jobs().await.unwrap());

        assert_eq!(manager.queues.queue(JobKind::Autoscaler).len().await.unwrap(), 2);
        assert_eq!(manager.queues.queue(JobKind::Launcher).len().await.unwrap(), 2);
        assert_eq!(manager.queues.queue(JobKind::Sanity).len().await.unwrap(), 2);

        // The grace key suppresses an immediate second pass.
        assert!(!manager.produce_group_jobs().await.unwrap());
        assert!(!manager.produce_sanity_jobs().await.unwrap());
        assert_eq!(manager.queues.queue(JobKind::Autoscaler).len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_producer_skips_when_locked() {
        let (env, manager, group_manager) = manager();
        group_manager
            .upsert_instance_group(test_group("bridges", GroupType::Bridge))
            .await
            .unwrap();

        let held = env.lock_manager().lock_job_creation().await.unwrap();
        assert!(!manager.produce_group_jobs().await.unwrap());
        assert_eq!(manager.queues.queue(JobKind::Autoscaler).len().await.unwrap(), 0);
        held.release().await;

        assert!(manager.produce_group_jobs().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_job_is_not_requeued() {
        let (_, manager, _) = manager();
        // Autoscaler job for a missing group fails.
        let job = Job {
            kind: JobKind::Autoscaler,
            group_name: "missing".to_string(),
        };
        assert!(!manager.run_job(&job).await);
        assert_eq!(manager.queues.queue(JobKind::Autoscaler).len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consumers_drain_queue() {
        let (_, manager, group_manager) = manager();
        group_manager
            .upsert_instance_group(test_group("bridges", GroupType::Bridge))
            .await
            .unwrap();

        assert!(manager.produce_group_jobs().await.unwrap());
        let handles = manager.start_consumers();

        // Wait for the queues to drain.
        for _ in 0..50 {
            let waiting = manager.queues.queue(JobKind::Autoscaler).len().await.unwrap()
                + manager.queues.queue(JobKind::Launcher).len().await.unwrap();
            if waiting == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(manager.queues.queue(JobKind::Autoscaler).len().await.unwrap(), 0);
        assert_eq!(manager.queues.queue(JobKind::Launcher).len().await.unwrap(), 0);

        for (handle, shutdown) in handles {
            let _ = shutdown.send(());
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_job_dispatches_sanity() {
        let (_, manager, group_manager) = manager();
        group_manager
            .upsert_instance_group(test_group("bridges", GroupType::Bridge))
            .await
            .unwrap();
        let job = Job {
            kind: JobKind::Sanity,
            group_name: "bridges".to_string(),
        };
        assert!(manager.run_job(&job).await);
    }
}
