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

//! Observation loops: the sanity pass reconciling the tracker against the
//! cloud listing, the Prometheus gauge refresh, and the operator report.

mod report;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub use report::*;
use tokio::sync::oneshot::Sender;
use tokio::task::JoinHandle;

use crate::cloud::{CloudManagerRef, CloudRetryStrategy};
use crate::error::AutoscalerResult;
use crate::manager::{AutoscalerEnv, InstanceGroupManagerRef, InstanceTrackerRef};
use crate::storage::{keys, InstanceStoreRef};
use crate::storage;

/// Maintain the per-group untracked-count key consumed by the launcher
/// throttle.
pub async fn set_untracked_count(
    store: &InstanceStoreRef,
    group: &str,
    count: u32,
    ttl: Duration,
) -> AutoscalerResult<()> {
    store
        .set_value(&keys::untracked_count(group), &count.to_string(), ttl)
        .await?;
    Ok(())
}

pub async fn get_untracked_count(
    store: &InstanceStoreRef,
    group: &str,
) -> AutoscalerResult<Option<u32>> {
    Ok(store
        .get_value(&keys::untracked_count(group))
        .await?
        .and_then(|raw| raw.parse().ok()))
}

/// Handler of per-group sanity jobs: enumerate the cloud, count instances
/// the tracker does not know about, refresh the untracked-count key and
/// the cloud gauges.
pub struct SanityLoop {
    env: AutoscalerEnv,
    tracker: InstanceTrackerRef,
    group_manager: InstanceGroupManagerRef,
    cloud_manager: CloudManagerRef,
}

impl SanityLoop {
    pub fn new(
        env: AutoscalerEnv,
        tracker: InstanceTrackerRef,
        group_manager: InstanceGroupManagerRef,
        cloud_manager: CloudManagerRef,
    ) -> Self {
        Self {
            env,
            tracker,
            group_manager,
            cloud_manager,
        }
    }

    pub async fn report_untracked_instances(&self, group_name: &str) -> AutoscalerResult<bool> {
        let lock = match self.env.lock_manager().lock_group(group_name).await {
            Ok(lock) => lock,
            Err(storage::Error::LockUnavailable(key)) => {
                tracing::warn!("group {} is locked ({}), skipping sanity pass", group_name, key);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let result = self.report_locked(group_name).await;
        lock.release().await;
        result
    }

    async fn report_locked(&self, group_name: &str) -> AutoscalerResult<bool> {
        let group = self.group_manager.require_instance_group(group_name).await?;

        // Shutting-down instances still count as tracked; only instances
        // the control plane has never heard of are suspicious.
        let states = self.tracker.trim_current(&group, false).await?;
        let tracked: HashSet<&str> = states.iter().map(|s| s.instance_id.as_str()).collect();

        let retry = CloudRetryStrategy::from_opts(self.env.opts());
        let cloud: Vec<_> = self
            .cloud_manager
            .get_instances(&group, &retry)
            .await?
            .into_iter()
            .filter(|instance| !instance.is_terminated())
            .collect();

        let untracked: Vec<&str> = cloud
            .iter()
            .filter(|instance| {
                instance.is_active() && !tracked.contains(instance.instance_id.as_str())
            })
            .map(|instance| instance.instance_id.as_str())
            .collect();
        if !untracked.is_empty() {
            tracing::warn!(
                "group {} has {} untracked instance(s): {:?}",
                group_name,
                untracked.len(),
                untracked
            );
        }

        set_untracked_count(
            self.env.store_ref(),
            group_name,
            untracked.len() as u32,
            self.env.opts().service_level_metrics_ttl,
        )
        .await?;

        let metrics = self.env.metrics();
        metrics
            .cloud_instance_count
            .with_label_values(&[group_name])
            .set(cloud.len() as i64);
        metrics
            .untracked_instance_count
            .with_label_values(&[group_name])
            .set(untracked.len() as i64);
        Ok(true)
    }
}

/// Periodic Prometheus gauge refresh over all groups.
pub struct MetricsLoop {
    env: AutoscalerEnv,
    tracker: InstanceTrackerRef,
    group_manager: InstanceGroupManagerRef,
}

impl MetricsLoop {
    pub fn new(
        env: AutoscalerEnv,
        tracker: InstanceTrackerRef,
        group_manager: InstanceGroupManagerRef,
    ) -> Self {
        Self {
            env,
            tracker,
            group_manager,
        }
    }

    pub fn start(self: Arc<Self>) -> (JoinHandle<()>, Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.env.opts().metrics_loop_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {},
                    _ = &mut shutdown_rx => {
                        tracing::info!("Metrics loop is stopped");
                        return;
                    }
                }
                if let Err(e) = self.refresh().await {
                    tracing::warn!("metrics refresh failed: {}", e);
                }
            }
        });
        (join_handle, shutdown_tx)
    }

    pub async fn refresh(&self) -> AutoscalerResult<()> {
        let groups = self.group_manager.get_all_instance_groups().await?;
        let metrics = self.env.metrics();
        metrics.groups_managed.set(groups.len() as i64);

        for group in groups {
            let labels = &[group.name.as_str()];
            metrics
                .desired_count
                .with_label_values(labels)
                .set(group.scaling_options.desired_count as i64);
            metrics
                .min_desired
                .with_label_values(labels)
                .set(group.scaling_options.min_desired as i64);
            metrics
                .max_desired
                .with_label_values(labels)
                .set(group.scaling_options.max_desired as i64);

            let inventory = self.tracker.trim_current(&group, true).await?;
            metrics
                .instance_count
                .with_label_values(labels)
                .set(inventory.len() as i64);
            let running = inventory.iter().filter(|s| !s.is_provisioning()).count();
            metrics
                .running_instance_count
                .with_label_values(labels)
                .set(running as i64);

            // The cloud-side gauges are maintained by the sanity pass;
            // the untracked count is mirrored from its store key.
            if let Some(untracked) =
                get_untracked_count(self.env.store_ref(), &group.name).await?
            {
                metrics
                    .untracked_instance_count
                    .with_label_values(labels)
                    .set(untracked as i64);
            }
        }
        Ok(())
    }
}
