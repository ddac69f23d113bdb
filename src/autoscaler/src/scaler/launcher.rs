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

//! Per-group reconciliation of live inventory against the desired count.
//! Scale-up launches through the cloud adapter; scale-down only marks
//! shutdown intent, the side-car does the rest.

use std::sync::Arc;
use std::time::Duration;

use fleetscale_common::util::time::now_ms;
use itertools::Itertools;

use crate::audit::{AuditRef, LauncherActionEvent, LauncherActionType};
use crate::cloud::CloudManagerRef;
use crate::error::{AutoscalerError, AutoscalerResult};
use crate::manager::{
    AutoscalerEnv, InstanceGroupManagerRef, InstanceTrackerRef, ShutdownManagerRef,
};
use crate::model::{BusyStatus, InstanceGroup, InstanceId, InstanceState, ScalingFamily};
use crate::monitor;
use crate::storage;

pub type InstanceLauncherRef = Arc<InstanceLauncher>;

pub struct InstanceLauncher {
    env: AutoscalerEnv,
    tracker: InstanceTrackerRef,
    group_manager: InstanceGroupManagerRef,
    shutdown_manager: ShutdownManagerRef,
    audit: AuditRef,
    cloud_manager: CloudManagerRef,
}

impl InstanceLauncher {
    pub fn new(
        env: AutoscalerEnv,
        tracker: InstanceTrackerRef,
        group_manager: InstanceGroupManagerRef,
        shutdown_manager: ShutdownManagerRef,
        audit: AuditRef,
        cloud_manager: CloudManagerRef,
    ) -> Self {
        Self {
            env,
            tracker,
            group_manager,
            shutdown_manager,
            audit,
            cloud_manager,
        }
    }

    /// One launcher pass over `group_name`, under the group lock.
    pub async fn launch_or_shutdown_instances_by_group(
        &self,
        group_name: &str,
    ) -> AutoscalerResult<bool> {
        let lock = match self.env.lock_manager().lock_group(group_name).await {
            Ok(lock) => lock,
            Err(storage::Error::LockUnavailable(key)) => {
                tracing::warn!("group {} is locked ({}), skipping launcher pass", group_name, key);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let result = self.process_locked(group_name).await;
        lock.release().await;

        if matches!(
            &result,
            Err(AutoscalerError::Cloud(_) | AutoscalerError::Throttled(_))
        ) {
            self.env
                .metrics()
                .instance_errors
                .with_label_values(&[group_name])
                .inc();
        }
        result
    }

    async fn process_locked(&self, group_name: &str) -> AutoscalerResult<bool> {
        let group = self.group_manager.require_instance_group(group_name).await?;
        if !group.enable_launch {
            tracing::info!("launcher disabled for group {}", group_name);
            return Ok(false);
        }

        self.audit.update_last_launcher_run(group_name).await?;

        let inventory = self.tracker.trim_current(&group, true).await?;
        let count = inventory.len() as u32;
        let desired = group.scaling_options.desired_count;

        if count < desired && count < group.scaling_options.max_desired {
            self.scale_up(&group, &inventory, count).await?;
        } else if count > desired && count > group.scaling_options.min_desired {
            self.scale_down(&group, &inventory, count).await?;
        } else {
            tracing::info!(
                "group {} has {} live instance(s) against desired {}, nothing to reconcile",
                group_name,
                count,
                desired
            );
        }
        Ok(true)
    }

    async fn scale_up(
        &self,
        group: &InstanceGroup,
        inventory: &[InstanceState],
        count: u32,
    ) -> AutoscalerResult<()> {
        let opts = &group.scaling_options;
        let want = opts.desired_count.min(opts.max_desired) - count;

        if group.enable_untracked_throttle {
            let untracked = monitor::get_untracked_count(self.env.store_ref(), &group.name)
                .await?
                .unwrap_or(0);
            let threshold = (opts.max_desired + 1).min(self.env.opts().max_throttle_threshold);
            if untracked >= threshold {
                return Err(AutoscalerError::Throttled(format!(
                    "group {} has {} untracked instance(s), threshold {}",
                    group.name, untracked, threshold
                )));
            }
        }

        let protected = self.group_manager.is_scale_down_protected(&group.name).await?;

        if self.env.opts().dry_run {
            tracing::info!(
                "dry run: would launch {} instance(s) for group {}",
                want,
                group.name
            );
            self.log_launcher_action(group, LauncherActionType::ScaleUp, count, want)
                .await?;
            return Ok(());
        }

        let launched: Vec<String> = self
            .cloud_manager
            .launch_instances(group, inventory, want)
            .await?
            .into_iter()
            .flatten()
            .collect();

        for instance_id in &launched {
            let state =
                InstanceState::provisioning(instance_id.clone(), group.group_type, &group.name);
            self.env.store().save_instance_status(&group.name, &state).await?;
            self.audit.log_request_to_launch(&group.name, instance_id).await?;
            if protected {
                self.env
                    .store()
                    .set_scale_down_protected(
                        instance_id,
                        "launch",
                        Duration::from_secs(group.protected_ttl_sec),
                    )
                    .await?;
            }
        }

        self.log_launcher_action(group, LauncherActionType::ScaleUp, count, want)
            .await?;
        self.env
            .metrics()
            .instances_launched
            .with_label_values(&[&group.name])
            .inc_by(launched.len() as u64);

        let launched_count = launched.len() as u32;
        if launched_count == 0 {
            return Err(AutoscalerError::Cloud(format!(
                "no instance launched for group {} (wanted {})",
                group.name, want
            )));
        }
        if launched_count < want {
            return Err(AutoscalerError::Cloud(format!(
                "launched {} of {} instance(s) for group {}",
                launched_count, want, group.name
            )));
        }
        tracing::info!("launched {} instance(s) for group {}", launched_count, group.name);
        Ok(())
    }

    async fn scale_down(
        &self,
        group: &InstanceGroup,
        inventory: &[InstanceState],
        count: u32,
    ) -> AutoscalerResult<()> {
        let victims = self.get_instances_for_scale_down(group, inventory, count).await?;
        if victims.is_empty() {
            tracing::error!(
                "group {} wants to scale down but has no unprotected victim",
                group.name
            );
            return Ok(());
        }

        if self.env.opts().dry_run {
            tracing::info!(
                "dry run: would shut down {:?} in group {}",
                victims,
                group.name
            );
            self.log_launcher_action(
                group,
                LauncherActionType::ScaleDown,
                count,
                victims.len() as u32,
            )
            .await?;
            return Ok(());
        }

        // Marking intent is all the launcher does; the side-cars observe
        // the marker and exit on their own schedule.
        self.shutdown_manager
            .set_shutdown_statuses(&group.name, &victims)
            .await?;
        self.log_launcher_action(
            group,
            LauncherActionType::ScaleDown,
            count,
            victims.len() as u32,
        )
        .await?;
        self.env
            .metrics()
            .instances_downscaled
            .with_label_values(&[&group.name])
            .inc_by(victims.len() as u64);
        Ok(())
    }

    /// Pick scale-down victims: never protected instances, and within the
    /// unprotected ones the cheapest to lose first.
    async fn get_instances_for_scale_down(
        &self,
        group: &InstanceGroup,
        inventory: &[InstanceState],
        count: u32,
    ) -> AutoscalerResult<Vec<InstanceId>> {
        let opts = &group.scaling_options;
        let quantity = count.saturating_sub(opts.min_desired.max(opts.desired_count)) as usize;

        let ids = inventory.iter().map(|s| s.instance_id.clone()).collect_vec();
        let protected = self.env.store().are_scale_down_protected(&ids).await?;
        let unprotected: Vec<&InstanceState> = inventory
            .iter()
            .zip(&protected)
            .filter_map(|(state, protected)| (!protected).then_some(state))
            .collect();

        let ordered: Vec<&InstanceState> = match group.scaling_family() {
            ScalingFamily::Availability => {
                // Prefer instances that never served (provisioning or
                // statusless), then expired sessions, then idle capacity;
                // busy recorders are the last resort.
                let class = |state: &InstanceState| match state.busy_status() {
                    None => 0,
                    Some(BusyStatus::Expired) => 1,
                    Some(BusyStatus::Idle) => 2,
                    Some(BusyStatus::Busy) => 3,
                };
                let mut ordered = unprotected;
                ordered.sort_by_key(|state| class(state));
                ordered
            }
            ScalingFamily::Stress => {
                let (cheap, mut running): (Vec<&InstanceState>, Vec<&InstanceState>) =
                    unprotected.into_iter().partition(|state| {
                        state.is_provisioning()
                            || matches!(state.status, crate::model::InstanceStatus::Unknown)
                    });
                running.sort_by(|a, b| {
                    a.scale_down_metric().total_cmp(&b.scale_down_metric())
                });
                let mut ordered = cheap;
                ordered.extend(running);
                ordered
            }
        };

        let selected = ordered
            .into_iter()
            .take(quantity)
            .map(|state| state.instance_id.clone())
            .collect_vec();
        if selected.len() < quantity {
            tracing::warn!(
                "group {} wanted {} scale-down victim(s) but only {} are eligible",
                group.name,
                quantity,
                selected.len()
            );
        }
        Ok(selected)
    }

    async fn log_launcher_action(
        &self,
        group: &InstanceGroup,
        action_type: LauncherActionType,
        count: u32,
        scale_quantity: u32,
    ) -> AutoscalerResult<()> {
        self.audit
            .log_launcher_action(
                &group.name,
                LauncherActionEvent {
                    timestamp_ms: now_ms(),
                    action_type,
                    count,
                    desired_count: group.scaling_options.desired_count,
                    scale_quantity,
                },
            )
            .await
    }
}
