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

//! The metrics and inventory core: ingests side-car reports, segments
//! metric history into period buckets and maintains each group's live
//! inventory.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use fleetscale_common::util::time::{now_ms, now_rfc3339};
use itertools::Itertools;

use crate::audit::AuditRef;
use crate::error::AutoscalerResult;
use crate::manager::{AutoscalerEnv, ShutdownManagerRef};
use crate::model::{
    AvailabilityStats, BusyStatus, GroupType, InstanceGroup, InstanceMetric, InstanceState,
    InstanceStatus, NomadStats, ScalingFamily, StatsReport, StressStatus,
};

pub type InstanceTrackerRef = Arc<InstanceTracker>;

/// Group used when a report carries no group metadata.
const DEFAULT_GROUP: &str = "default";

pub struct InstanceTracker {
    env: AutoscalerEnv,
    shutdown_manager: ShutdownManagerRef,
    audit: AuditRef,
}

impl InstanceTracker {
    pub fn new(env: AutoscalerEnv, shutdown_manager: ShutdownManagerRef, audit: AuditRef) -> Self {
        Self {
            env,
            shutdown_manager,
            audit,
        }
    }

    /// Ingest one side-car report. `shutdown_status` is the side-car's own
    /// claim that it is going away, in addition to the flag inside the
    /// report body.
    pub async fn stats(&self, report: StatsReport, shutdown_status: bool) -> AutoscalerResult<()> {
        let status = Self::parse_status(&report);
        let state = InstanceState {
            instance_id: report.instance.instance_id.clone(),
            instance_type: report.instance.instance_type,
            status,
            timestamp_ms: report.timestamp_ms.unwrap_or_else(now_ms),
            metadata: report.instance.metadata.clone(),
            shutdown_status: false,
            shutdown_complete: None,
            last_reconfigured: report.reconfigure_complete.clone(),
            reconfigure_error: report.reconfigure_error,
            shutdown_error: report.shutdown_error,
            stats_error: report.stats_error,
        };
        self.track(state, shutdown_status || report.shutdown_status)
            .await
    }

    fn parse_status(report: &StatsReport) -> InstanceStatus {
        if report.stats_error {
            tracing::warn!(
                "stats error reported by instance {}, leaving status unset",
                report.instance.instance_id
            );
            return InstanceStatus::Unknown;
        }
        let Some(stats) = &report.stats else {
            tracing::warn!(
                "empty stats from instance {}, leaving status unset",
                report.instance.instance_id
            );
            return InstanceStatus::Unknown;
        };
        let parsed = match report.instance.instance_type {
            GroupType::Recorder | GroupType::Availability => {
                serde_json::from_value::<AvailabilityStats>(stats.clone())
                    .map(|stats| InstanceStatus::Availability(stats.status))
            }
            GroupType::Nomad => serde_json::from_value::<NomadStats>(stats.clone())
                .map(|stats| InstanceStatus::Nomad(stats.into_status())),
            GroupType::Bridge | GroupType::Gateway | GroupType::GenericStress => {
                serde_json::from_value::<StressStatus>(stats.clone()).map(InstanceStatus::Stress)
            }
        };
        match parsed {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    "unparseable stats from instance {}: {}",
                    report.instance.instance_id,
                    e
                );
                InstanceStatus::Unknown
            }
        }
    }

    /// Persist `state` and, for a live instance, derive one metric point.
    pub async fn track(
        &self,
        mut state: InstanceState,
        shutdown_status: bool,
    ) -> AutoscalerResult<()> {
        let group = state
            .metadata
            .group
            .clone()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());

        if shutdown_status {
            // The side-car confirms it is shutting down.
            let confirmed_at = now_rfc3339();
            state.shutdown_status = true;
            state.shutdown_complete = Some(confirmed_at.clone());
            self.shutdown_manager
                .set_shutdown_confirmation(&group, &state.instance_id, &confirmed_at)
                .await?;
        } else if self
            .shutdown_manager
            .get_shutdown_status(&state.instance_id)
            .await?
        {
            // Marked by the control plane; the side-car just has not
            // noticed yet.
            state.shutdown_status = true;
        }

        self.env.store().save_instance_status(&group, &state).await?;

        if !state.is_provisioning() && !state.is_shutting_down() {
            if let Some(value) = Self::metric_value(&state) {
                let metric = InstanceMetric {
                    instance_id: state.instance_id.clone(),
                    timestamp_ms: state.timestamp_ms,
                    value,
                };
                self.env
                    .store()
                    .write_instance_metric(&group, &metric, self.env.opts().metric_ttl)
                    .await?;
            }
        }

        self.audit.log_latest_status(&group, &state).await
    }

    /// The scalar load sample of one state: idle capacity for the
    /// availability family, stress level otherwise. `None` skips the
    /// metric write.
    fn metric_value(state: &InstanceState) -> Option<f64> {
        match &state.status {
            InstanceStatus::Availability(a) => {
                Some(if a.busy_status == BusyStatus::Idle { 1.0 } else { 0.0 })
            }
            InstanceStatus::Stress(s) => s.stress_level,
            InstanceStatus::Nomad(n) => Some(n.stress_level),
            InstanceStatus::Provisioning | InstanceStatus::Unknown => None,
        }
    }

    /// Metric points of a group segmented into `periods_count` buckets of
    /// `period_sec` seconds, bucket 0 being the newest.
    ///
    /// A one-bucket reporting gap is repaired by carrying the instance's
    /// most recent point forward from the older neighbor bucket, but only
    /// when the instance is present on both sides of the gap (or the gap
    /// is the newest bucket). Instances that stopped or started reporting
    /// are not invented into buckets they never covered.
    pub async fn get_metric_inventory_per_period(
        &self,
        group: &str,
        periods_count: usize,
        period_sec: u64,
    ) -> AutoscalerResult<Vec<Vec<InstanceMetric>>> {
        let now = now_ms();
        let period_ms = period_sec.max(1) * 1000;
        let metrics = self
            .env
            .store()
            .get_instance_metrics(group, self.env.opts().metric_ttl)
            .await?;

        let mut buckets = vec![Vec::new(); periods_count];
        for metric in metrics {
            let age = now.saturating_sub(metric.timestamp_ms);
            let idx = (age / period_ms) as usize;
            if idx < periods_count {
                buckets[idx].push(metric);
            }
        }

        if periods_count >= 2 {
            let all_instances: BTreeSet<String> = buckets
                .iter()
                .flatten()
                .map(|m| m.instance_id.clone())
                .collect();
            for i in (0..periods_count - 1).rev() {
                let mut filled = Vec::new();
                for id in &all_instances {
                    if buckets[i].iter().any(|m| m.instance_id == *id) {
                        continue;
                    }
                    let Some(source) = buckets[i + 1]
                        .iter()
                        .filter(|m| m.instance_id == *id)
                        .max_by_key(|m| m.timestamp_ms)
                    else {
                        continue;
                    };
                    if i > 0 && !buckets[i - 1].iter().any(|m| m.instance_id == *id) {
                        continue;
                    }
                    let mut copy = source.clone();
                    // Shift one period so the copy sits inside this
                    // bucket's time range.
                    copy.timestamp_ms += period_ms;
                    filled.push(copy);
                }
                buckets[i].extend(filled);
            }
        }

        Ok(buckets)
    }

    /// Per-bucket summary: per-instance mean first, then sum (availability
    /// family) or mean (stress family) across instances. `None` marks a
    /// bucket with no points at all.
    pub fn get_summary_metric_per_period(
        group: &InstanceGroup,
        buckets: &[Vec<InstanceMetric>],
        period_count: usize,
    ) -> Vec<Option<f64>> {
        (0..period_count)
            .map(|i| {
                let bucket = buckets.get(i)?;
                if bucket.is_empty() {
                    return None;
                }
                let mut sums: HashMap<&str, (f64, u32)> = HashMap::new();
                for metric in bucket {
                    let entry = sums.entry(metric.instance_id.as_str()).or_insert((0.0, 0));
                    entry.0 += metric.value;
                    entry.1 += 1;
                }
                let means = sums.values().map(|(sum, count)| sum / *count as f64);
                match group.scaling_family() {
                    ScalingFamily::Availability => Some(means.sum()),
                    ScalingFamily::Stress => {
                        Some(means.sum::<f64>() / sums.len() as f64)
                    }
                }
            })
            .collect()
    }

    /// The group's live inventory: fetch, trim expired rows, and (unless
    /// `filter_shutdown` is off) drop every instance that is shutting down
    /// or has already confirmed shutdown.
    pub async fn trim_current(
        &self,
        group: &InstanceGroup,
        filter_shutdown: bool,
    ) -> AutoscalerResult<Vec<InstanceState>> {
        let states = self.env.store().fetch_instance_states(&group.name).await?;
        let mut valid = self
            .env
            .store()
            .filter_out_and_trim_expired_states(
                &group.name,
                states,
                &self.env.opts().state_ttl_policy(),
            )
            .await?;

        if filter_shutdown {
            let ids = valid.iter().map(|s| s.instance_id.clone()).collect_vec();
            let marked = self.shutdown_manager.get_shutdown_statuses(&ids).await?;
            let confirmed = self
                .shutdown_manager
                .get_shutdown_confirmations(&ids)
                .await?;
            valid = valid
                .into_iter()
                .zip(marked.into_iter().zip(confirmed))
                .filter_map(|(state, (marked, confirmed))| {
                    let gone = state.is_shutting_down()
                        || state.shutdown_complete.is_some()
                        || marked
                        || confirmed.is_some();
                    (!gone).then_some(state)
                })
                .collect();
        }

        Ok(valid)
    }
}
