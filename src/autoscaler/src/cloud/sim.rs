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

//! In-process provider for local development and tests: keeps a fleet per
//! group in memory and supports injected launch failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;

use super::{CloudInstance, CloudInstanceManager, CloudRetryStrategy};
use crate::error::AutoscalerResult;
use crate::model::{InstanceGroup, InstanceState};

#[derive(Default)]
pub struct SimulatedCloudManager {
    fleets: Mutex<HashMap<String, Vec<CloudInstance>>>,
    /// Number of upcoming launch attempts that fail, for tests.
    failures_remaining: AtomicUsize,
}

impl SimulatedCloudManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_launches(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Register an instance directly, bypassing a launch. Used to model
    /// instances the tracker does not know about.
    pub fn insert_instance(&self, group: &str, instance: CloudInstance) {
        self.fleets
            .lock()
            .entry(group.to_string())
            .or_default()
            .push(instance);
    }

    pub fn set_status(&self, group: &str, instance_id: &str, status: &str) {
        if let Some(fleet) = self.fleets.lock().get_mut(group) {
            for instance in fleet.iter_mut().filter(|i| i.instance_id == instance_id) {
                instance.cloud_status = status.to_string();
            }
        }
    }

    fn try_launch(&self, group: &str) -> Option<String> {
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return None;
        }
        let instance_id = format!("sim-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        self.fleets
            .lock()
            .entry(group.to_string())
            .or_default()
            .push(CloudInstance {
                instance_id: instance_id.clone(),
                display_name: format!("{}-{}", group, instance_id),
                cloud_status: "Provisioning".to_string(),
            });
        Some(instance_id)
    }
}

#[async_trait]
impl CloudInstanceManager for SimulatedCloudManager {
    async fn launch_instances(
        &self,
        group: &InstanceGroup,
        _current_inventory: &[InstanceState],
        quantity: u32,
    ) -> AutoscalerResult<Vec<Option<String>>> {
        // Per-index fan-out; a failed slot does not abort the rest.
        let launches = (0..quantity).map(|_| async { self.try_launch(&group.name) });
        Ok(join_all(launches).await)
    }

    async fn get_instances(
        &self,
        group: &InstanceGroup,
        _retry: &CloudRetryStrategy,
    ) -> AutoscalerResult<Vec<CloudInstance>> {
        Ok(self
            .fleets
            .lock()
            .get(&group.name)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupType;
    use crate::test_utils::test_group;

    fn retry() -> CloudRetryStrategy {
        CloudRetryStrategy {
            max_time: std::time::Duration::from_secs(1),
            max_delay: std::time::Duration::from_secs(1),
            retryable_status_codes: vec![],
        }
    }

    #[tokio::test]
    async fn test_launch_and_enumerate() {
        let sim = SimulatedCloudManager::new();
        let group = test_group("bridges", GroupType::Bridge);

        let launched = sim.launch_instances(&group, &[], 3).await.unwrap();
        assert_eq!(launched.len(), 3);
        assert!(launched.iter().all(|id| id.is_some()));

        let instances = sim.get_instances(&group, &retry()).await.unwrap();
        assert_eq!(instances.len(), 3);
        assert!(instances.iter().all(|i| i.cloud_status == "Provisioning"));
    }

    #[tokio::test]
    async fn test_partial_failures_do_not_abort() {
        let sim = SimulatedCloudManager::new();
        let group = test_group("bridges", GroupType::Bridge);

        sim.fail_next_launches(2);
        let launched = sim.launch_instances(&group, &[], 5).await.unwrap();
        assert_eq!(launched.len(), 5);
        assert_eq!(launched.iter().filter(|id| id.is_none()).count(), 2);
        assert_eq!(launched.iter().filter(|id| id.is_some()).count(), 3);
    }
}
