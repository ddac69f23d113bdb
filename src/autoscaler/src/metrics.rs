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

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

/// Process-wide collectors, created once at init and labeled by group.
/// Label removal on group deletion is explicit via [`AutoscalerMetrics::remove_group`].
pub struct AutoscalerMetrics {
    registry: Registry,

    pub instances_launched: IntCounterVec,
    pub instances_downscaled: IntCounterVec,
    pub instance_errors: IntCounterVec,

    pub groups_managed: IntGauge,
    pub desired_count: IntGaugeVec,
    pub min_desired: IntGaugeVec,
    pub max_desired: IntGaugeVec,
    pub instance_count: IntGaugeVec,
    pub running_instance_count: IntGaugeVec,
    pub cloud_instance_count: IntGaugeVec,
    pub untracked_instance_count: IntGaugeVec,

    pub queue_waiting: IntGaugeVec,
}

impl AutoscalerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let instances_launched = register_int_counter_vec_with_registry!(
            "autoscaling_instance_launched_total",
            "Total number of instances launched",
            &["group"],
            registry
        )
        .unwrap();
        let instances_downscaled = register_int_counter_vec_with_registry!(
            "autoscaling_instance_downscaled_total",
            "Total number of instances selected for scale-down",
            &["group"],
            registry
        )
        .unwrap();
        let instance_errors = register_int_counter_vec_with_registry!(
            "autoscaling_instance_errors_total",
            "Total number of failed launcher passes",
            &["group"],
            registry
        )
        .unwrap();

        let groups_managed = register_int_gauge_with_registry!(
            "autoscaling_groups_managed",
            "Number of instance groups under management",
            registry
        )
        .unwrap();
        let desired_count = register_int_gauge_vec_with_registry!(
            "autoscaling_desired_count",
            "Current desired count per group",
            &["group"],
            registry
        )
        .unwrap();
        let min_desired = register_int_gauge_vec_with_registry!(
            "autoscaling_min_desired",
            "Lower desired-count bound per group",
            &["group"],
            registry
        )
        .unwrap();
        let max_desired = register_int_gauge_vec_with_registry!(
            "autoscaling_max_desired",
            "Upper desired-count bound per group",
            &["group"],
            registry
        )
        .unwrap();
        let instance_count = register_int_gauge_vec_with_registry!(
            "autoscaling_instance_count",
            "Tracked inventory size per group",
            &["group"],
            registry
        )
        .unwrap();
        let running_instance_count = register_int_gauge_vec_with_registry!(
            "autoscaling_running_instance_count",
            "Tracked non-provisioning instances per group",
            &["group"],
            registry
        )
        .unwrap();
        let cloud_instance_count = register_int_gauge_vec_with_registry!(
            "autoscaling_cloud_instance_count",
            "Cloud-visible instances per group",
            &["group"],
            registry
        )
        .unwrap();
        let untracked_instance_count = register_int_gauge_vec_with_registry!(
            "autoscaling_untracked_instance_count",
            "Cloud-visible instances missing from the tracker per group",
            &["group"],
            registry
        )
        .unwrap();

        let queue_waiting = register_int_gauge_vec_with_registry!(
            "autoscaling_queue_waiting",
            "Jobs waiting per queue",
            &["queue"],
            registry
        )
        .unwrap();

        Self {
            registry,
            instances_launched,
            instances_downscaled,
            instance_errors,
            groups_managed,
            desired_count,
            min_desired,
            max_desired,
            instance_count,
            running_instance_count,
            cloud_instance_count,
            untracked_instance_count,
            queue_waiting,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Drop a deleted group's label values so stale series stop being
    /// exported.
    pub fn remove_group(&self, group: &str) {
        let labels = &[group];
        let _ = self.instances_launched.remove_label_values(labels);
        let _ = self.instances_downscaled.remove_label_values(labels);
        let _ = self.instance_errors.remove_label_values(labels);
        let _ = self.desired_count.remove_label_values(labels);
        let _ = self.min_desired.remove_label_values(labels);
        let _ = self.max_desired.remove_label_values(labels);
        let _ = self.instance_count.remove_label_values(labels);
        let _ = self.running_instance_count.remove_label_values(labels);
        let _ = self.cloud_instance_count.remove_label_values(labels);
        let _ = self.untracked_instance_count.remove_label_values(labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_group_drops_series() {
        let metrics = AutoscalerMetrics::new();
        metrics.desired_count.with_label_values(&["g"]).set(3);
        metrics.instances_launched.with_label_values(&["g"]).inc();

        let before = metrics.registry.gather();
        assert!(before
            .iter()
            .any(|mf| mf.get_name() == "autoscaling_desired_count" && !mf.get_metric().is_empty()));

        metrics.remove_group("g");
        let after = metrics.registry.gather();
        assert!(!after
            .iter()
            .any(|mf| mf.get_name() == "autoscaling_desired_count" && !mf.get_metric().is_empty()));
    }
}
