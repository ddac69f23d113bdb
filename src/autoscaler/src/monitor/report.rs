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

//! Operator-facing group report: tracker state merged with the cloud
//! listing and bulk-enriched with shutdown, protection and reconfigure
//! markers.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetscale_common::util::time::now_ms;
use serde::Serialize;

use crate::cloud::{CloudInstance, CloudManagerRef, CloudRetryStrategy};
use crate::error::AutoscalerResult;
use crate::manager::{
    AutoscalerEnv, InstanceGroupManagerRef, InstanceTrackerRef, ReconfigureManagerRef,
    ShutdownManagerRef,
};
use crate::model::{BusyStatus, InstanceState, InstanceStatus};

pub type GroupReportGeneratorRef = Arc<GroupReportGenerator>;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReportRow {
    pub instance_id: String,
    pub scale_status: String,
    pub cloud_status: String,
    pub is_shutting_down: bool,
    pub shutdown_complete: Option<String>,
    pub last_reconfigured: Option<String>,
    pub is_scale_down_protected: bool,
    pub reconfigure_scheduled: Option<String>,
    pub untracked: bool,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub version: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReport {
    pub group_name: String,
    pub timestamp_ms: u64,
    pub desired_count: u32,
    pub min_desired: u32,
    pub max_desired: u32,
    pub instance_count: usize,
    pub provisioning_count: usize,
    pub available_count: usize,
    pub busy_count: usize,
    pub expired_count: usize,
    pub shutting_down_count: usize,
    pub untracked_count: usize,
    pub cloud_instance_count: usize,
    pub instances: Vec<InstanceReportRow>,
}

pub struct GroupReportGenerator {
    env: AutoscalerEnv,
    tracker: InstanceTrackerRef,
    group_manager: InstanceGroupManagerRef,
    shutdown_manager: ShutdownManagerRef,
    reconfigure_manager: ReconfigureManagerRef,
    cloud_manager: CloudManagerRef,
}

impl GroupReportGenerator {
    pub fn new(
        env: AutoscalerEnv,
        tracker: InstanceTrackerRef,
        group_manager: InstanceGroupManagerRef,
        shutdown_manager: ShutdownManagerRef,
        reconfigure_manager: ReconfigureManagerRef,
        cloud_manager: CloudManagerRef,
    ) -> Self {
        Self {
            env,
            tracker,
            group_manager,
            shutdown_manager,
            reconfigure_manager,
            cloud_manager,
        }
    }

    fn scale_status(state: &InstanceState) -> &'static str {
        match &state.status {
            InstanceStatus::Provisioning => "PROVISIONING",
            InstanceStatus::Unknown => "UNKNOWN",
            InstanceStatus::Availability(a) => match a.busy_status {
                BusyStatus::Idle => "AVAILABLE",
                BusyStatus::Busy => "IN_USE",
                BusyStatus::Expired => "EXPIRED",
            },
            InstanceStatus::Stress(_) | InstanceStatus::Nomad(_) => "IN_SERVICE",
        }
    }

    pub async fn generate_report(
        &self,
        group_name: &str,
        cloud_instances: Option<Vec<CloudInstance>>,
    ) -> AutoscalerResult<GroupReport> {
        let group = self.group_manager.require_instance_group(group_name).await?;

        let states = self.tracker.trim_current(&group, false).await?;
        let cloud = match cloud_instances {
            Some(cloud) => cloud,
            None => {
                let retry = CloudRetryStrategy::from_opts(self.env.opts());
                self.cloud_manager.get_instances(&group, &retry).await?
            }
        };
        let cloud: BTreeMap<String, CloudInstance> = cloud
            .into_iter()
            .filter(|instance| !instance.is_terminated())
            .map(|instance| (instance.instance_id.clone(), instance))
            .collect();

        let mut rows: BTreeMap<String, InstanceReportRow> = BTreeMap::new();
        for state in &states {
            rows.insert(
                state.instance_id.clone(),
                InstanceReportRow {
                    instance_id: state.instance_id.clone(),
                    scale_status: Self::scale_status(state).to_string(),
                    cloud_status: cloud
                        .get(&state.instance_id)
                        .map(|c| c.cloud_status.clone())
                        .unwrap_or_default(),
                    is_shutting_down: state.is_shutting_down(),
                    shutdown_complete: state.shutdown_complete.clone(),
                    last_reconfigured: state.last_reconfigured.clone(),
                    is_scale_down_protected: false,
                    reconfigure_scheduled: None,
                    untracked: false,
                    public_ip: state.metadata.public_ip.clone(),
                    private_ip: state.metadata.private_ip.clone(),
                    version: state.metadata.version.clone(),
                },
            );
        }
        for (id, instance) in &cloud {
            if !rows.contains_key(id) && instance.is_active() {
                rows.insert(
                    id.clone(),
                    InstanceReportRow {
                        instance_id: id.clone(),
                        scale_status: "UNTRACKED".to_string(),
                        cloud_status: instance.cloud_status.clone(),
                        is_shutting_down: false,
                        shutdown_complete: None,
                        last_reconfigured: None,
                        is_scale_down_protected: false,
                        reconfigure_scheduled: None,
                        untracked: true,
                        public_ip: None,
                        private_ip: None,
                        version: None,
                    },
                );
            }
        }

        // Bulk-enrich with the short-TTL markers.
        let ids: Vec<String> = rows.keys().cloned().collect();
        let shutdown = self.shutdown_manager.get_shutdown_statuses(&ids).await?;
        let confirmations = self.shutdown_manager.get_shutdown_confirmations(&ids).await?;
        let protected = self.env.store().are_scale_down_protected(&ids).await?;
        let reconfigure = self.reconfigure_manager.get_reconfigure_dates(&ids).await?;
        for (i, id) in ids.iter().enumerate() {
            let row = rows.get_mut(id).unwrap();
            row.is_shutting_down = row.is_shutting_down || shutdown[i];
            if row.shutdown_complete.is_none() {
                row.shutdown_complete = confirmations[i].clone();
            }
            row.is_scale_down_protected = protected[i];
            row.reconfigure_scheduled = reconfigure[i].clone();
        }

        let instances: Vec<InstanceReportRow> = rows.into_values().collect();
        let report = GroupReport {
            group_name: group_name.to_string(),
            timestamp_ms: now_ms(),
            desired_count: group.scaling_options.desired_count,
            min_desired: group.scaling_options.min_desired,
            max_desired: group.scaling_options.max_desired,
            instance_count: states.len(),
            provisioning_count: instances
                .iter()
                .filter(|r| r.scale_status == "PROVISIONING")
                .count(),
            available_count: instances
                .iter()
                .filter(|r| r.scale_status == "AVAILABLE")
                .count(),
            busy_count: instances.iter().filter(|r| r.scale_status == "IN_USE").count(),
            expired_count: instances
                .iter()
                .filter(|r| r.scale_status == "EXPIRED")
                .count(),
            shutting_down_count: instances.iter().filter(|r| r.is_shutting_down).count(),
            untracked_count: instances.iter().filter(|r| r.untracked).count(),
            cloud_instance_count: cloud.len(),
            instances,
        };
        Ok(report)
    }
}
