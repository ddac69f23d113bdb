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

//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::api::ApiContext;
use crate::audit::Audit;
use crate::cloud::{CloudManager, SimulatedCloudManager};
use crate::manager::{
    AutoscalerEnv, InstanceGroupManager, InstanceTracker, ReconfigureManager, ShutdownManager,
};
use crate::model::{
    GroupType, InstanceGroup, InstanceMetadata, ReportedInstance, ScalingOptions, StatsReport,
};
use crate::monitor::GroupReportGenerator;

pub fn test_group(name: &str, group_type: GroupType) -> InstanceGroup {
    InstanceGroup {
        name: name.to_string(),
        group_type,
        region: "eu-west-1".to_string(),
        environment: "test".to_string(),
        cloud: "sim".to_string(),
        compartment_id: "compartment".to_string(),
        instance_configuration_id: "config-1".to_string(),
        enable_auto_scale: true,
        enable_launch: true,
        enable_scheduler: true,
        enable_untracked_throttle: true,
        grace_period_ttl_sec: 60,
        protected_ttl_sec: 600,
        scaling_options: ScalingOptions {
            min_desired: 1,
            max_desired: 5,
            desired_count: 2,
            scale_up_quantity: 1,
            scale_down_quantity: 1,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_period_sec: 60,
            scale_up_periods_count: 2,
            scale_down_periods_count: 2,
        },
        tags: Default::default(),
    }
}

pub fn stats_report(
    instance_id: &str,
    instance_type: GroupType,
    group: &str,
    stats: serde_json::Value,
) -> StatsReport {
    StatsReport {
        instance: ReportedInstance {
            instance_id: instance_id.to_string(),
            instance_type,
            metadata: InstanceMetadata {
                group: Some(group.to_string()),
                ..Default::default()
            },
        },
        timestamp_ms: None,
        stats: Some(stats),
        shutdown_status: false,
        shutdown_error: false,
        reconfigure_error: false,
        stats_error: false,
        reconfigure_complete: None,
    }
}

pub fn tracker_fixture() -> (AutoscalerEnv, InstanceTracker) {
    let env = AutoscalerEnv::for_test();
    let audit = Arc::new(Audit::new(&env));
    let shutdown_manager = Arc::new(ShutdownManager::new(env.clone(), audit.clone()));
    let tracker = InstanceTracker::new(env.clone(), shutdown_manager, audit);
    (env, tracker)
}

pub fn api_context() -> ApiContext {
    api_context_with_seed(Vec::new())
}

pub fn api_context_with_seed(seed: Vec<InstanceGroup>) -> ApiContext {
    let env = AutoscalerEnv::for_test();
    let audit = Arc::new(Audit::new(&env));
    let shutdown_manager = Arc::new(ShutdownManager::new(env.clone(), audit.clone()));
    let reconfigure_manager = Arc::new(ReconfigureManager::new(env.clone(), audit.clone()));
    let tracker = Arc::new(InstanceTracker::new(
        env.clone(),
        shutdown_manager.clone(),
        audit.clone(),
    ));
    let group_manager = Arc::new(InstanceGroupManager::new(env.clone()));
    let cloud_manager = Arc::new(
        CloudManager::new().with_adapter("sim", Arc::new(SimulatedCloudManager::new())),
    );
    let report_generator = Arc::new(GroupReportGenerator::new(
        env.clone(),
        tracker.clone(),
        group_manager.clone(),
        shutdown_manager.clone(),
        reconfigure_manager.clone(),
        cloud_manager,
    ));
    ApiContext {
        env,
        tracker,
        group_manager,
        shutdown_manager,
        reconfigure_manager,
        audit,
        report_generator,
        seed_groups: Arc::new(seed),
    }
}
