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

//! In-process store for single-replica deployments and tests.
//!
//! The key space is hierarchical; instance hashes and metric series are
//! emulated with key prefixes. There is no native TTL, so every entry
//! carries its own expiry timestamp and expired entries are treated as
//! absent and removed on contact.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fleetscale_common::util::time::now_ms;
use parking_lot::Mutex;

use super::instance_store::{keys, InstanceStore};
use super::Result;
use crate::model::{InstanceGroup, InstanceId, InstanceMetric, InstanceState};

#[derive(Clone, Debug)]
struct StoredEntry {
    value: String,
    /// Unix ms after which the entry is treated as absent. `None` never
    /// expires.
    expire_at_ms: Option<u64>,
}

impl StoredEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expire_at_ms.is_some_and(|at| at < now)
    }
}

#[derive(Default)]
pub struct MemStore {
    entries: Mutex<BTreeMap<String, StoredEntry>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&self, key: String, value: String, ttl: Option<Duration>) {
        let expire_at_ms = ttl.map(|ttl| now_ms() + ttl.as_millis() as u64);
        self.entries
            .lock()
            .insert(key, StoredEntry { value, expire_at_ms });
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now_ms()) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Live `(key, value)` pairs under `prefix`, compacting expired
    /// entries on the way.
    fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let now = now_ms();
        let mut entries = self.entries.lock();
        let hits: Vec<(String, StoredEntry)> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut live = Vec::with_capacity(hits.len());
        for (key, entry) in hits {
            if entry.is_expired(now) {
                entries.remove(&key);
            } else {
                live.push((key, entry.value));
            }
        }
        live
    }

    fn state_key(group: &str, id: &str) -> String {
        format!("{}:{}", keys::instance_status_hash(group), id)
    }

    fn metric_key(group: &str, metric: &InstanceMetric) -> String {
        format!(
            "{}:{:020}:{}",
            keys::metric_set(group),
            metric.timestamp_ms,
            metric.instance_id
        )
    }
}

#[async_trait]
impl InstanceStore for MemStore {
    async fn get_instance_group(&self, name: &str) -> Result<Option<InstanceGroup>> {
        match self.get(&keys::group(name)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn upsert_instance_group(&self, group: &InstanceGroup) -> Result<()> {
        self.put(
            keys::group(&group.name),
            serde_json::to_string(group)?,
            None,
        );
        Ok(())
    }

    async fn delete_instance_group(&self, name: &str) -> Result<()> {
        self.remove(&keys::group(name));
        Ok(())
    }

    async fn get_all_instance_groups(&self) -> Result<Vec<InstanceGroup>> {
        self.scan_prefix(keys::GROUP_PREFIX)
            .into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(Into::into))
            .collect()
    }

    async fn fetch_instance_states(&self, group: &str) -> Result<Vec<InstanceState>> {
        let prefix = format!("{}:", keys::instance_status_hash(group));
        self.scan_prefix(&prefix)
            .into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(Into::into))
            .collect()
    }

    async fn save_instance_status(&self, group: &str, state: &InstanceState) -> Result<()> {
        self.put(
            Self::state_key(group, &state.instance_id),
            serde_json::to_string(state)?,
            None,
        );
        Ok(())
    }

    async fn delete_instance_states(&self, group: &str, ids: &[InstanceId]) -> Result<()> {
        for id in ids {
            self.remove(&Self::state_key(group, id));
        }
        Ok(())
    }

    async fn write_instance_metric(
        &self,
        group: &str,
        metric: &InstanceMetric,
        ttl: Duration,
    ) -> Result<()> {
        self.put(
            Self::metric_key(group, metric),
            serde_json::to_string(metric)?,
            Some(ttl),
        );
        Ok(())
    }

    async fn get_instance_metrics(
        &self,
        group: &str,
        retention: Duration,
    ) -> Result<Vec<InstanceMetric>> {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let prefix = format!("{}:", keys::metric_set(group));
        let mut metrics = Vec::new();
        for (_, raw) in self.scan_prefix(&prefix) {
            let metric: InstanceMetric = serde_json::from_str(&raw)?;
            if metric.timestamp_ms >= cutoff {
                metrics.push(metric);
            }
        }
        Ok(metrics)
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.put(key.to_string(), value.to_string(), Some(ttl));
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key))
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    async fn list_values(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .scan_prefix(prefix)
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) && entry.value != owner => Ok(false),
            _ => {
                entries.insert(
                    key.to_string(),
                    StoredEntry {
                        value: owner.to_string(),
                        expire_at_ms: Some(now + ttl.as_millis() as u64),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.value == owner) {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::instance_store::StateTtlPolicy;
    use super::*;
    use crate::model::{GroupType, ScalingOptions};

    fn group(name: &str) -> InstanceGroup {
        InstanceGroup {
            name: name.to_string(),
            group_type: GroupType::Bridge,
            region: "eu-west-1".to_string(),
            environment: "test".to_string(),
            cloud: "sim".to_string(),
            compartment_id: "compartment".to_string(),
            instance_configuration_id: "config".to_string(),
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

    #[tokio::test]
    async fn test_group_crud() {
        let store = MemStore::new();
        assert!(!store.exists_at_least_one_group().await.unwrap());

        store.upsert_instance_group(&group("bridges")).await.unwrap();
        store.upsert_instance_group(&group("gateways")).await.unwrap();

        assert!(store.exists_at_least_one_group().await.unwrap());
        let mut names = store.get_all_instance_group_names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["bridges", "gateways"]);

        let fetched = store.get_instance_group("bridges").await.unwrap().unwrap();
        assert_eq!(fetched.name, "bridges");

        store.delete_instance_group("bridges").await.unwrap();
        assert!(store.get_instance_group("bridges").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_value_ttl_expiry() {
        let store = MemStore::new();
        store
            .set_value("grace", "false", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(store.check_value("grace").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.check_value("grace").await.unwrap());
        assert!(store.get_value("grace").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metric_retention() {
        let store = MemStore::new();
        let now = now_ms();
        let fresh = InstanceMetric {
            instance_id: "i-1".to_string(),
            timestamp_ms: now,
            value: 0.5,
        };
        let stale = InstanceMetric {
            instance_id: "i-1".to_string(),
            timestamp_ms: now - 10_000,
            value: 0.9,
        };
        store
            .write_instance_metric("g", &fresh, Duration::from_secs(3600))
            .await
            .unwrap();
        store
            .write_instance_metric("g", &stale, Duration::from_secs(3600))
            .await
            .unwrap();

        let within = store
            .get_instance_metrics("g", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(within, vec![fresh.clone()]);

        let all = store
            .get_instance_metrics("g", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_trim_expired_states() {
        let store = MemStore::new();
        let ttls = StateTtlPolicy {
            idle_ttl: Duration::from_secs(90),
            provisioning_ttl: Duration::from_secs(420),
            shutdown_status_ttl: Duration::from_secs(86_400),
        };

        let mut fresh = InstanceState::provisioning("i-fresh".to_string(), GroupType::Bridge, "g");
        fresh.status = crate::model::InstanceStatus::Unknown;
        let mut stale = fresh.clone();
        stale.instance_id = "i-stale".to_string();
        stale.timestamp_ms = now_ms() - 100_000;
        // Still provisioning, so the longer provisioning TTL applies.
        let mut provisioning =
            InstanceState::provisioning("i-prov".to_string(), GroupType::Bridge, "g");
        provisioning.timestamp_ms = now_ms() - 100_000;

        for state in [&fresh, &stale, &provisioning] {
            store.save_instance_status("g", state).await.unwrap();
        }

        let states = store.fetch_instance_states("g").await.unwrap();
        let valid = store
            .filter_out_and_trim_expired_states("g", states, &ttls)
            .await
            .unwrap();
        let mut ids: Vec<_> = valid.iter().map(|s| s.instance_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["i-fresh", "i-prov"]);

        // The expired row is gone from storage too.
        let remaining = store.fetch_instance_states("g").await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_cas() {
        let store = MemStore::new();
        assert!(store
            .try_acquire_lock("lock:group:g", "owner-a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .try_acquire_lock("lock:group:g", "owner-b", Duration::from_secs(10))
            .await
            .unwrap());

        // Releasing with the wrong owner is a no-op.
        store.release_lock("lock:group:g", "owner-b").await.unwrap();
        assert!(!store
            .try_acquire_lock("lock:group:g", "owner-b", Duration::from_secs(10))
            .await
            .unwrap());

        store.release_lock("lock:group:g", "owner-a").await.unwrap();
        assert!(store
            .try_acquire_lock("lock:group:g", "owner-b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_lock_expires_by_ttl() {
        let store = MemStore::new();
        assert!(store
            .try_acquire_lock("lock:group:g", "owner-a", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // A crashed holder's lock falls off by TTL.
        assert!(store
            .try_acquire_lock("lock:group:g", "owner-b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_and_protection_markers() {
        let store = MemStore::new();
        let ids = vec!["i-1".to_string(), "i-2".to_string()];
        store
            .set_shutdown_statuses(&ids, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.get_shutdown_statuses(&ids).await.unwrap(),
            vec![true, true]
        );
        assert!(!store.get_shutdown_status("i-3").await.unwrap());

        store
            .set_scale_down_protected("i-2", "launch", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.are_scale_down_protected(&ids).await.unwrap(),
            vec![false, true]
        );
    }
}
