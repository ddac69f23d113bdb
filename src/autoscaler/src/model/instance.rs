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

use serde::{Deserialize, Serialize};

use super::GroupType;

pub type InstanceId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusyStatus {
    Idle,
    Busy,
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Status of a recorder-family worker: a unit of capacity that is either
/// free or occupied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityStatus {
    pub busy_status: BusyStatus,
    pub health: HealthStatus,
}

/// Status of a stress-family worker (bridges, gateways, generic). Field
/// names mirror the side-car wire format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StressStatus {
    #[serde(default)]
    pub stress_level: Option<f64>,
    #[serde(default)]
    pub participants: Option<f64>,
    #[serde(default, rename = "allocatedCPU")]
    pub allocated_cpu: Option<f64>,
    #[serde(default)]
    pub connections: Option<f64>,
    #[serde(default)]
    pub graceful_shutdown: bool,
}

/// Status derived from a nomad-style report: stress is the allocated share
/// of CPU, and an ineligible node is treated as shutting down.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NomadStatus {
    pub stress_level: f64,
    pub eligible_for_scheduling: bool,
    #[serde(rename = "allocatedCPU")]
    pub allocated_cpu: f64,
    #[serde(rename = "unallocatedCPU")]
    pub unallocated_cpu: f64,
}

/// The tagged status of one instance. `Provisioning` is set by the launcher
/// before the side-car's first report; `Unknown` records a report whose
/// stats were absent or unparseable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InstanceStatus {
    Provisioning,
    Unknown,
    Availability(AvailabilityStatus),
    Stress(StressStatus),
    Nomad(NomadStatus),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// The current view of one worker, as persisted in the instance store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    pub instance_id: InstanceId,
    pub instance_type: GroupType,
    pub status: InstanceStatus,
    /// Report time, Unix milliseconds.
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: InstanceMetadata,

    /// Set when the control plane has marked this instance for shutdown.
    #[serde(default)]
    pub shutdown_status: bool,
    /// ISO timestamp of the side-car's shutdown confirmation.
    #[serde(default)]
    pub shutdown_complete: Option<String>,
    /// ISO timestamp of the last applied reconfigure.
    #[serde(default)]
    pub last_reconfigured: Option<String>,

    #[serde(default)]
    pub reconfigure_error: bool,
    #[serde(default)]
    pub shutdown_error: bool,
    #[serde(default)]
    pub stats_error: bool,
}

impl InstanceState {
    /// A provisioning placeholder written by the launcher on successful
    /// launch, before the side-car's first report.
    pub fn provisioning(instance_id: InstanceId, instance_type: GroupType, group: &str) -> Self {
        Self {
            instance_id,
            instance_type,
            status: InstanceStatus::Provisioning,
            timestamp_ms: fleetscale_common::util::time::now_ms(),
            metadata: InstanceMetadata {
                group: Some(group.to_string()),
                ..Default::default()
            },
            shutdown_status: false,
            shutdown_complete: None,
            last_reconfigured: None,
            reconfigure_error: false,
            shutdown_error: false,
            stats_error: false,
        }
    }

    pub fn is_provisioning(&self) -> bool {
        matches!(self.status, InstanceStatus::Provisioning)
    }

    /// An instance counts as shutting down when it has been marked by the
    /// control plane, when it reports a graceful shutdown itself, or when a
    /// nomad node is no longer eligible for scheduling.
    pub fn is_shutting_down(&self) -> bool {
        if self.shutdown_status {
            return true;
        }
        match &self.status {
            InstanceStatus::Stress(stress) => stress.graceful_shutdown,
            InstanceStatus::Nomad(nomad) => !nomad.eligible_for_scheduling,
            _ => false,
        }
    }

    pub fn busy_status(&self) -> Option<BusyStatus> {
        match &self.status {
            InstanceStatus::Availability(a) => Some(a.busy_status),
            _ => None,
        }
    }

    /// The value instances are ordered by when selecting stress-family
    /// scale-down victims: the first defined of participants, allocated
    /// CPU, connections and stress level.
    pub fn scale_down_metric(&self) -> f64 {
        match &self.status {
            InstanceStatus::Stress(stress) => stress
                .participants
                .or(stress.allocated_cpu)
                .or(stress.connections)
                .or(stress.stress_level)
                .unwrap_or(0.0),
            InstanceStatus::Nomad(nomad) => nomad.stress_level,
            _ => 0.0,
        }
    }
}

/// The instance identification block of a side-car report.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedInstance {
    pub instance_id: InstanceId,
    pub instance_type: GroupType,
    #[serde(default)]
    pub metadata: InstanceMetadata,
}

/// One side-car report, as received on `/stats` and `/status`.
///
/// `stats` is kept raw here; the tracker parses it according to
/// `instance.instance_type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub instance: ReportedInstance,
    /// Report time, Unix milliseconds; defaults to arrival time.
    #[serde(default, rename = "timestamp")]
    pub timestamp_ms: Option<u64>,
    #[serde(default)]
    pub stats: Option<serde_json::Value>,

    #[serde(default)]
    pub shutdown_status: bool,
    #[serde(default)]
    pub shutdown_error: bool,
    #[serde(default)]
    pub reconfigure_error: bool,
    #[serde(default)]
    pub stats_error: bool,
    /// ISO timestamp of a completed reconfigure, echoed back by the
    /// side-car.
    #[serde(default)]
    pub reconfigure_complete: Option<String>,
}

/// Availability-family stats wrap the status one level deep on the wire.
#[derive(Clone, Debug, Deserialize)]
pub struct AvailabilityStats {
    pub status: AvailabilityStatus,
}

/// Raw nomad-style stats. Eligibility arrives as a label; anything other
/// than `"eligible"` means the node is being drained.
#[derive(Clone, Debug, Deserialize)]
pub struct NomadStats {
    #[serde(rename = "allocatedCPU")]
    pub allocated_cpu: f64,
    #[serde(rename = "unallocatedCPU")]
    pub unallocated_cpu: f64,
    #[serde(rename = "eligibleForScheduling")]
    pub eligibility: String,
}

impl NomadStats {
    pub fn into_status(self) -> NomadStatus {
        let total = self.allocated_cpu + self.unallocated_cpu;
        let stress_level = if total > 0.0 {
            self.allocated_cpu / total
        } else {
            0.0
        };
        let eligible = self.eligibility == "eligible";
        NomadStatus {
            stress_level,
            eligible_for_scheduling: eligible,
            allocated_cpu: self.allocated_cpu,
            unallocated_cpu: self.unallocated_cpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stress_wire_names() {
        let json = r#"{
            "stress_level": 0.4,
            "participants": 12,
            "allocatedCPU": 3.5,
            "graceful_shutdown": true
        }"#;
        let stress: StressStatus = serde_json::from_str(json).unwrap();
        assert_eq!(stress.stress_level, Some(0.4));
        assert_eq!(stress.participants, Some(12.0));
        assert_eq!(stress.allocated_cpu, Some(3.5));
        assert_eq!(stress.connections, None);
        assert!(stress.graceful_shutdown);
    }

    #[test]
    fn test_nomad_stress_derivation() {
        let stats = NomadStats {
            allocated_cpu: 3.0,
            unallocated_cpu: 1.0,
            eligibility: "eligible".to_string(),
        };
        let status = stats.into_status();
        assert_eq!(status.stress_level, 0.75);
        assert!(status.eligible_for_scheduling);

        let drained = NomadStats {
            allocated_cpu: 0.0,
            unallocated_cpu: 0.0,
            eligibility: "ineligible".to_string(),
        };
        let status = drained.into_status();
        assert_eq!(status.stress_level, 0.0);
        assert!(!status.eligible_for_scheduling);
    }

    #[test]
    fn test_is_shutting_down() {
        let mut state = InstanceState::provisioning("i-1".to_string(), GroupType::Bridge, "g");
        assert!(!state.is_shutting_down());

        state.shutdown_status = true;
        assert!(state.is_shutting_down());

        state.shutdown_status = false;
        state.status = InstanceStatus::Stress(StressStatus {
            graceful_shutdown: true,
            ..Default::default()
        });
        assert!(state.is_shutting_down());

        state.status = InstanceStatus::Nomad(NomadStatus {
            stress_level: 0.5,
            eligible_for_scheduling: false,
            allocated_cpu: 1.0,
            unallocated_cpu: 1.0,
        });
        assert!(state.is_shutting_down());
    }

    #[test]
    fn test_scale_down_metric_precedence() {
        let mut state = InstanceState::provisioning("i-1".to_string(), GroupType::Bridge, "g");
        state.status = InstanceStatus::Stress(StressStatus {
            stress_level: Some(0.9),
            participants: Some(7.0),
            allocated_cpu: Some(2.0),
            connections: Some(100.0),
            graceful_shutdown: false,
        });
        assert_eq!(state.scale_down_metric(), 7.0);

        state.status = InstanceStatus::Stress(StressStatus {
            stress_level: Some(0.9),
            connections: Some(100.0),
            ..Default::default()
        });
        assert_eq!(state.scale_down_metric(), 100.0);

        state.status = InstanceStatus::Unknown;
        assert_eq!(state.scale_down_metric(), 0.0);
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let state = InstanceState {
            instance_id: "i-42".to_string(),
            instance_type: GroupType::Recorder,
            status: InstanceStatus::Availability(AvailabilityStatus {
                busy_status: BusyStatus::Idle,
                health: HealthStatus::Healthy,
            }),
            timestamp_ms: 1000,
            metadata: InstanceMetadata {
                group: Some("recorders".to_string()),
                public_ip: Some("10.0.0.1".to_string()),
                ..Default::default()
            },
            shutdown_status: false,
            shutdown_complete: None,
            last_reconfigured: Some("2025-05-01T00:00:00+00:00".to_string()),
            reconfigure_error: false,
            shutdown_error: false,
            stats_error: false,
        };
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: InstanceState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }
}
