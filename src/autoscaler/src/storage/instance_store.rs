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

//! The store contract every state-holding component consumes. This is the
//! only abstraction performing I/O for durable state.
//!
//! Backends implement the primitive key/value, hash and metric operations;
//! the bulk marker operations are provided on top of them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetscale_common::util::time::now_ms;

use super::Result;
use crate::model::{InstanceGroup, InstanceId, InstanceMetric, InstanceState};

pub type InstanceStoreRef = Arc<dyn InstanceStore>;

/// Effective inventory TTLs by instance phase.
#[derive(Clone, Copy, Debug)]
pub struct StateTtlPolicy {
    pub idle_ttl: Duration,
    pub provisioning_ttl: Duration,
    pub shutdown_status_ttl: Duration,
}

impl StateTtlPolicy {
    pub fn effective_ttl(&self, state: &InstanceState) -> Duration {
        if state.is_provisioning() {
            self.provisioning_ttl
        } else if state.is_shutting_down() {
            self.shutdown_status_ttl
        } else {
            self.idle_ttl
        }
    }
}

/// Logical key layout, shared by both backends.
pub mod keys {
    pub const GROUP_PREFIX: &str = "group:";
    pub const GROUP_JOBS_CREATION_GRACE: &str = "groupJobsCreationGracePeriod";
    pub const SANITY_JOBS_CREATION_GRACE: &str = "sanityJobsCreationGracePeriod";
    pub const JOB_CREATION_LOCK: &str = "lock:jobCreation";

    pub fn group(name: &str) -> String {
        format!("{}{}", GROUP_PREFIX, name)
    }

    pub fn instance_status_hash(group: &str) -> String {
        format!("instances:status:{}", group)
    }

    pub fn metric_set(group: &str) -> String {
        format!("metric:instances:{}", group)
    }

    pub fn shutdown(instance_id: &str) -> String {
        format!("instance:shutdown:{}", instance_id)
    }

    pub fn shutdown_confirmation(instance_id: &str) -> String {
        format!("instance:shutdownConfirmation:{}", instance_id)
    }

    pub fn scale_down_protected(instance_id: &str) -> String {
        format!("instance:scaleDownProtected:{}", instance_id)
    }

    pub fn reconfigure(instance_id: &str) -> String {
        format!("instance:reconfigure:{}", instance_id)
    }

    pub fn autoscale_grace(group: &str) -> String {
        format!("autoScaleGracePeriod:{}", group)
    }

    pub fn sanity_grace(group: &str) -> String {
        format!("sanityGracePeriod:{}", group)
    }

    pub fn group_scale_down_protected(group: &str) -> String {
        format!("isScaleDownProtected:{}", group)
    }

    pub fn untracked_count(group: &str) -> String {
        format!("service-metrics:{}:untracked-count", group)
    }

    pub fn audit(group: &str, scope: &str, kind: &str) -> String {
        format!("audit:{}:{}:{}", group, scope, kind)
    }

    pub fn audit_prefix(group: &str) -> String {
        format!("audit:{}:", group)
    }

    pub fn group_lock(group: &str) -> String {
        format!("lock:group:{}", group)
    }

    pub fn job_queue(queue: &str) -> String {
        format!("jobs:queue:{}", queue)
    }
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    // ------------------------------------------------ group definitions

    async fn get_instance_group(&self, name: &str) -> Result<Option<InstanceGroup>>;

    async fn upsert_instance_group(&self, group: &InstanceGroup) -> Result<()>;

    async fn delete_instance_group(&self, name: &str) -> Result<()>;

    async fn get_all_instance_groups(&self) -> Result<Vec<InstanceGroup>>;

    async fn get_all_instance_group_names(&self) -> Result<Vec<String>> {
        Ok(self
            .get_all_instance_groups()
            .await?
            .into_iter()
            .map(|g| g.name)
            .collect())
    }

    async fn exists_at_least_one_group(&self) -> Result<bool> {
        Ok(!self.get_all_instance_groups().await?.is_empty())
    }

    // ------------------------------------------------ instance states

    async fn fetch_instance_states(&self, group: &str) -> Result<Vec<InstanceState>>;

    async fn save_instance_status(&self, group: &str, state: &InstanceState) -> Result<()>;

    async fn delete_instance_states(&self, group: &str, ids: &[InstanceId]) -> Result<()>;

    /// Split `states` by effective TTL, delete the expired rows from
    /// storage and return only the still-valid ones.
    async fn filter_out_and_trim_expired_states(
        &self,
        group: &str,
        states: Vec<InstanceState>,
        ttls: &StateTtlPolicy,
    ) -> Result<Vec<InstanceState>> {
        let now = now_ms();
        let (valid, expired): (Vec<_>, Vec<_>) = states.into_iter().partition(|state| {
            let ttl_ms = ttls.effective_ttl(state).as_millis() as u64;
            state.timestamp_ms + ttl_ms >= now
        });
        if !expired.is_empty() {
            let ids: Vec<_> = expired.iter().map(|s| s.instance_id.clone()).collect();
            tracing::info!("trimming {} expired state(s) in group {}", ids.len(), group);
            self.delete_instance_states(group, &ids).await?;
        }
        Ok(valid)
    }

    // ------------------------------------------------ metrics

    async fn write_instance_metric(
        &self,
        group: &str,
        metric: &InstanceMetric,
        ttl: Duration,
    ) -> Result<()>;

    /// All metric points of a group no older than `retention`.
    async fn get_instance_metrics(
        &self,
        group: &str,
        retention: Duration,
    ) -> Result<Vec<InstanceMetric>>;

    // ------------------------------------------------ plain values

    /// The grace-timer primitive: a TTL-bounded key whose presence is the
    /// signal.
    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    async fn check_value(&self, key: &str) -> Result<bool> {
        Ok(self.get_value(key).await?.is_some())
    }

    async fn delete_value(&self, key: &str) -> Result<()>;

    /// Values of all live keys under `prefix`.
    async fn list_values(&self, prefix: &str) -> Result<Vec<String>>;

    // ------------------------------------------------ locks

    /// Compare-and-swap acquisition of `key` for `owner`, true when taken.
    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release `key` only if still held by `owner`.
    async fn release_lock(&self, key: &str, owner: &str) -> Result<()>;

    // ------------------------------------------------ shutdown markers

    async fn set_shutdown_statuses(&self, ids: &[InstanceId], ttl: Duration) -> Result<()> {
        for id in ids {
            self.set_value(&keys::shutdown(id), "shutdown", ttl).await?;
        }
        Ok(())
    }

    async fn get_shutdown_status(&self, id: &str) -> Result<bool> {
        self.check_value(&keys::shutdown(id)).await
    }

    async fn get_shutdown_statuses(&self, ids: &[InstanceId]) -> Result<Vec<bool>> {
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            statuses.push(self.get_shutdown_status(id).await?);
        }
        Ok(statuses)
    }

    async fn set_shutdown_confirmations(
        &self,
        ids: &[InstanceId],
        confirmed_at: &str,
        ttl: Duration,
    ) -> Result<()> {
        for id in ids {
            self.set_value(&keys::shutdown_confirmation(id), confirmed_at, ttl)
                .await?;
        }
        Ok(())
    }

    async fn get_shutdown_confirmation(&self, id: &str) -> Result<Option<String>> {
        self.get_value(&keys::shutdown_confirmation(id)).await
    }

    async fn get_shutdown_confirmations(&self, ids: &[InstanceId]) -> Result<Vec<Option<String>>> {
        let mut confirmations = Vec::with_capacity(ids.len());
        for id in ids {
            confirmations.push(self.get_shutdown_confirmation(id).await?);
        }
        Ok(confirmations)
    }

    // ------------------------------------------------ scale-down protection

    async fn set_scale_down_protected(&self, id: &str, mode: &str, ttl: Duration) -> Result<()> {
        self.set_value(&keys::scale_down_protected(id), mode, ttl)
            .await
    }

    async fn are_scale_down_protected(&self, ids: &[InstanceId]) -> Result<Vec<bool>> {
        let mut protected = Vec::with_capacity(ids.len());
        for id in ids {
            protected.push(self.check_value(&keys::scale_down_protected(id)).await?);
        }
        Ok(protected)
    }

    // ------------------------------------------------ reconfigure markers

    async fn set_reconfigure_dates(
        &self,
        ids: &[InstanceId],
        date: &str,
        ttl: Duration,
    ) -> Result<()> {
        for id in ids {
            self.set_value(&keys::reconfigure(id), date, ttl).await?;
        }
        Ok(())
    }

    async fn unset_reconfigure_date(&self, id: &str) -> Result<()> {
        self.delete_value(&keys::reconfigure(id)).await
    }

    async fn get_reconfigure_date(&self, id: &str) -> Result<Option<String>> {
        self.get_value(&keys::reconfigure(id)).await
    }

    async fn get_reconfigure_dates(&self, ids: &[InstanceId]) -> Result<Vec<Option<String>>> {
        let mut dates = Vec::with_capacity(ids.len());
        for id in ids {
            dates.push(self.get_reconfigure_date(id).await?);
        }
        Ok(dates)
    }
}
