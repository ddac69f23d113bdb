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

//! Pool-style adapter: some providers only expose an "update pool size"
//! primitive and attach instances themselves. New instance ids are
//! discovered by diffing the pool listing before and after the resize.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::{call_with_retry, CloudInstance, CloudInstanceManager, CloudRetryStrategy};
use crate::error::AutoscalerResult;
use crate::model::{InstanceGroup, InstanceState};

/// The provider-side surface of an instance pool.
#[async_trait]
pub trait InstancePool: Send + Sync {
    async fn get_pool_size(&self, group: &InstanceGroup) -> AutoscalerResult<u32>;

    async fn set_pool_size(&self, group: &InstanceGroup, size: u32) -> AutoscalerResult<()>;

    async fn list_instances(&self, group: &InstanceGroup) -> AutoscalerResult<Vec<CloudInstance>>;
}

pub struct PoolCloudManager {
    pool: Arc<dyn InstancePool>,
}

impl PoolCloudManager {
    pub fn new(pool: Arc<dyn InstancePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CloudInstanceManager for PoolCloudManager {
    async fn launch_instances(
        &self,
        group: &InstanceGroup,
        _current_inventory: &[InstanceState],
        quantity: u32,
    ) -> AutoscalerResult<Vec<Option<String>>> {
        let before: HashSet<String> = self
            .pool
            .list_instances(group)
            .await?
            .into_iter()
            .map(|i| i.instance_id)
            .collect();

        let size = self.pool.get_pool_size(group).await?;
        self.pool.set_pool_size(group, size + quantity).await?;

        let after = self.pool.list_instances(group).await?;
        let mut launched: Vec<Option<String>> = after
            .into_iter()
            .filter(|i| !before.contains(&i.instance_id))
            .take(quantity as usize)
            .map(|i| Some(i.instance_id))
            .collect();
        // Slots the pool did not (yet) fill count as failed attempts.
        launched.resize(quantity as usize, None);
        Ok(launched)
    }

    async fn get_instances(
        &self,
        group: &InstanceGroup,
        retry: &CloudRetryStrategy,
    ) -> AutoscalerResult<Vec<CloudInstance>> {
        call_with_retry(retry, || self.pool.list_instances(group)).await
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::model::GroupType;
    use crate::test_utils::test_group;

    /// A pool that attaches `fill` instances of every requested increase.
    struct FakePool {
        instances: Mutex<Vec<CloudInstance>>,
        size: Mutex<u32>,
        fill: u32,
    }

    impl FakePool {
        fn new(fill: u32) -> Self {
            Self {
                instances: Mutex::new(Vec::new()),
                size: Mutex::new(0),
                fill,
            }
        }
    }

    #[async_trait]
    impl InstancePool for FakePool {
        async fn get_pool_size(&self, _group: &InstanceGroup) -> AutoscalerResult<u32> {
            Ok(*self.size.lock())
        }

        async fn set_pool_size(&self, _group: &InstanceGroup, size: u32) -> AutoscalerResult<()> {
            let mut current = self.size.lock();
            let grow = size.saturating_sub(*current).min(self.fill);
            let mut instances = self.instances.lock();
            for _ in 0..grow {
                let n = instances.len();
                instances.push(CloudInstance {
                    instance_id: format!("pool-{}", n),
                    display_name: format!("pool-{}", n),
                    cloud_status: "Provisioning".to_string(),
                });
            }
            *current = size;
            Ok(())
        }

        async fn list_instances(
            &self,
            _group: &InstanceGroup,
        ) -> AutoscalerResult<Vec<CloudInstance>> {
            Ok(self.instances.lock().clone())
        }
    }

    #[tokio::test]
    async fn test_diff_discovers_new_ids() {
        let pool = Arc::new(FakePool::new(10));
        let manager = PoolCloudManager::new(pool.clone());
        let group = test_group("bridges", GroupType::Bridge);

        let first = manager.launch_instances(&group, &[], 2).await.unwrap();
        assert_eq!(first.iter().flatten().count(), 2);

        // The second launch must not re-report the first batch.
        let second = manager.launch_instances(&group, &[], 1).await.unwrap();
        let ids: Vec<_> = second.iter().flatten().collect();
        assert_eq!(ids.len(), 1);
        assert!(first.iter().flatten().all(|id| id != ids[0]));
    }

    #[tokio::test]
    async fn test_unfilled_slots_report_as_failures() {
        let pool = Arc::new(FakePool::new(1));
        let manager = PoolCloudManager::new(pool);
        let group = test_group("bridges", GroupType::Bridge);

        let launched = manager.launch_instances(&group, &[], 3).await.unwrap();
        assert_eq!(launched.len(), 3);
        assert_eq!(launched.iter().filter(|id| id.is_some()).count(), 1);
        assert_eq!(launched.iter().filter(|id| id.is_none()).count(), 2);
    }
}
