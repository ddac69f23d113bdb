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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The role of the workers in a group. The set is closed; every downstream
/// dispatch is a total match on the [`ScalingFamily`] derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupType {
    Recorder,
    Availability,
    Bridge,
    Gateway,
    GenericStress,
    Nomad,
}

/// How a group's load metric behaves. `Availability` metrics count idle
/// capacity and rise with slack; `Stress` metrics average load and fall
/// with slack. Threshold comparisons flip direction between the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingFamily {
    Availability,
    Stress,
}

impl GroupType {
    pub fn scaling_family(self) -> ScalingFamily {
        match self {
            GroupType::Recorder | GroupType::Availability => ScalingFamily::Availability,
            GroupType::Bridge | GroupType::Gateway | GroupType::GenericStress | GroupType::Nomad => {
                ScalingFamily::Stress
            }
        }
    }
}

/// Per-group controller parameters.
///
/// `min_desired <= desired_count <= max_desired` holds after any mutation;
/// [`ScalingOptions::set_desired`] clamps into the range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingOptions {
    pub min_desired: u32,
    pub max_desired: u32,
    pub desired_count: u32,

    /// Instances added per scale-up action.
    pub scale_up_quantity: u32,
    /// Instances removed per scale-down action.
    pub scale_down_quantity: u32,

    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,

    /// Metric bucket width, in seconds.
    pub scale_period_sec: u64,
    /// Consecutive buckets that must all satisfy the scale-up predicate.
    pub scale_up_periods_count: u32,
    /// Consecutive buckets that must all satisfy the scale-down predicate.
    pub scale_down_periods_count: u32,
}

impl ScalingOptions {
    /// Set the desired count, clamped into `[min_desired, max_desired]`.
    pub fn set_desired(&mut self, desired: u32) {
        self.desired_count = desired.clamp(self.min_desired, self.max_desired);
    }

    pub fn clamp_desired(&mut self) {
        self.desired_count = self.desired_count.clamp(self.min_desired, self.max_desired);
    }

    /// The larger of the two evaluation windows, in buckets.
    pub fn evaluation_periods(&self) -> u32 {
        self.scale_up_periods_count.max(self.scale_down_periods_count)
    }
}

/// The policy unit: a named cohort of instances sharing a type, region,
/// cloud, provisioning template and scaling policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub region: String,
    pub environment: String,
    pub cloud: String,
    pub compartment_id: String,
    /// Opaque provisioning template key, passed through to the cloud
    /// adapter.
    pub instance_configuration_id: String,

    pub enable_auto_scale: bool,
    pub enable_launch: bool,
    pub enable_scheduler: bool,
    pub enable_untracked_throttle: bool,

    /// Seconds to suppress further autoscaler adjustments after an action.
    pub grace_period_ttl_sec: u64,
    /// Lifetime of scale-down protection markers created for this group.
    pub protected_ttl_sec: u64,

    pub scaling_options: ScalingOptions,

    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl InstanceGroup {
    pub fn scaling_family(&self) -> ScalingFamily {
        self.group_type.scaling_family()
    }
}

/// `min <= desired <= max`, the admission rule for desired-count updates.
pub fn group_has_valid_desired_values(min: u32, max: u32, desired: u32) -> bool {
    min <= desired && desired <= max
}
