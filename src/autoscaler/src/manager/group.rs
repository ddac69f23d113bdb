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

use std::sync::Arc;
use std::time::Duration;

use crate::error::{AutoscalerError, AutoscalerResult};
use crate::manager::AutoscalerEnv;
use crate::model::InstanceGroup;
use crate::storage::keys;

pub type InstanceGroupManagerRef = Arc<InstanceGroupManager>;

/// Group CRUD plus the TTL-backed grace gates that pace the autoscaler,
/// the job producers and scale-down protection.
pub struct InstanceGroupManager {
    env: AutoscalerEnv,
}

impl InstanceGroupManager {
    pub fn new(env: AutoscalerEnv) -> Self {
        Self { env }
    }

    pub async fn get_instance_group(&self, name: &str) -> AutoscalerResult<Option<InstanceGroup>> {
        Ok(self.env.store().get_instance_group(name).await?)
    }

    pub async fn require_instance_group(&self, name: &str) -> AutoscalerResult<InstanceGroup> {
        self.get_instance_group(name)
            .await?
            .ok_or_else(|| AutoscalerError::GroupNotFound(name.to_string()))
    }

    /// Persist a group. The desired count is clamped into `[min, max]`
    /// first, so the bounds invariant holds after any mutation.
    pub async fn upsert_instance_group(&self, mut group: InstanceGroup) -> AutoscalerResult<()> {
        group.scaling_options.clamp_desired();
        Ok(self.env.store().upsert_instance_group(&group).await?)
    }

    pub async fn delete_instance_group(&self, name: &str) -> AutoscalerResult<()> {
        self.env.store().delete_instance_group(name).await?;
        self.env.metrics().remove_group(name);
        Ok(())
    }

    pub async fn get_all_instance_groups(&self) -> AutoscalerResult<Vec<InstanceGroup>> {
        Ok(self.env.store().get_all_instance_groups().await?)
    }

    pub async fn get_all_instance_group_names(&self) -> AutoscalerResult<Vec<String>> {
        Ok(self.env.store().get_all_instance_group_names().await?)
    }

    pub async fn exists_at_least_one_group(&self) -> AutoscalerResult<bool> {
        Ok(self.env.store().exists_at_least_one_group().await?)
    }

    // ------------------------------------------------ grace gates

    /// False while the post-action grace period of the group holds.
    pub async fn allow_autoscaling(&self, group: &str) -> AutoscalerResult<bool> {
        Ok(!self
            .env
            .store()
            .check_value(&keys::autoscale_grace(group))
            .await?)
    }

    pub async fn set_auto_scale_grace_period(&self, group: &InstanceGroup) -> AutoscalerResult<()> {
        self.env
            .store()
            .set_value(
                &keys::autoscale_grace(&group.name),
                "false",
                Duration::from_secs(group.grace_period_ttl_sec),
            )
            .await?;
        Ok(())
    }

    pub async fn is_group_jobs_creation_allowed(&self) -> AutoscalerResult<bool> {
        Ok(!self
            .env
            .store()
            .check_value(keys::GROUP_JOBS_CREATION_GRACE)
            .await?)
    }

    pub async fn set_group_jobs_creation_grace_period(&self) -> AutoscalerResult<()> {
        self.env
            .store()
            .set_value(
                keys::GROUP_JOBS_CREATION_GRACE,
                "false",
                self.env.opts().group_jobs_creation_grace_period,
            )
            .await?;
        Ok(())
    }

    pub async fn is_sanity_jobs_creation_allowed(&self) -> AutoscalerResult<bool> {
        Ok(!self
            .env
            .store()
            .check_value(keys::SANITY_JOBS_CREATION_GRACE)
            .await?)
    }

    pub async fn set_sanity_jobs_creation_grace_period(&self) -> AutoscalerResult<()> {
        self.env
            .store()
            .set_value(
                keys::SANITY_JOBS_CREATION_GRACE,
                "false",
                self.env.opts().sanity_jobs_creation_grace_period,
            )
            .await?;
        Ok(())
    }

    /// True while the group-wide scale-down protection marker holds.
    pub async fn is_scale_down_protected(&self, group: &str) -> AutoscalerResult<bool> {
        Ok(self
            .env
            .store()
            .check_value(&keys::group_scale_down_protected(group))
            .await?)
    }

    pub async fn set_group_scale_down_protected(
        &self,
        group: &str,
        ttl: Duration,
    ) -> AutoscalerResult<()> {
        self.env
            .store()
            .set_value(&keys::group_scale_down_protected(group), "protected", ttl)
            .await?;
        Ok(())
    }

    // ------------------------------------------------ seeding

    /// Initial seeding: applied only when the store holds no group at all.
    pub async fn apply_seed_groups(&self, seed: &[InstanceGroup]) -> AutoscalerResult<()> {
        if self.exists_at_least_one_group().await? {
            return Ok(());
        }
        tracing::info!("seeding {} instance group(s)", seed.len());
        for group in seed {
            self.upsert_instance_group(group.clone()).await?;
        }
        Ok(())
    }

    /// Re-apply the seed list without overwriting the desired count of
    /// groups that already exist.
    pub async fn reset_seed_groups(&self, seed: &[InstanceGroup]) -> AutoscalerResult<()> {
        for group in seed {
            let mut group = group.clone();
            if let Some(existing) = self.get_instance_group(&group.name).await? {
                group.scaling_options.desired_count = existing.scaling_options.desired_count;
            }
            self.upsert_instance_group(group).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupType;
    use crate::test_utils::test_group;

    #[tokio::test]
    async fn test_upsert_clamps_desired() {
        let env = AutoscalerEnv::for_test();
        let manager = InstanceGroupManager::new(env);

        let mut group = test_group("bridges", GroupType::Bridge);
        group.scaling_options.desired_count = 100;
        manager.upsert_instance_group(group).await.unwrap();

        let stored = manager.require_instance_group("bridges").await.unwrap();
        assert_eq!(stored.scaling_options.desired_count, 5);
    }

    #[tokio::test]
    async fn test_require_missing_group() {
        let env = AutoscalerEnv::for_test();
        let manager = InstanceGroupManager::new(env);
        assert!(matches!(
            manager.require_instance_group("nope").await,
            Err(AutoscalerError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_autoscale_grace_gate() {
        let env = AutoscalerEnv::for_test();
        let manager = InstanceGroupManager::new(env);
        let mut group = test_group("bridges", GroupType::Bridge);
        group.grace_period_ttl_sec = 1;

        assert!(manager.allow_autoscaling("bridges").await.unwrap());
        manager.set_auto_scale_grace_period(&group).await.unwrap();
        assert!(!manager.allow_autoscaling("bridges").await.unwrap());
        // Unrelated groups are not gated.
        assert!(manager.allow_autoscaling("gateways").await.unwrap());
    }

    #[tokio::test]
    async fn test_seed_only_when_empty() {
        let env = AutoscalerEnv::for_test();
        let manager = InstanceGroupManager::new(env);

        manager
            .apply_seed_groups(&[test_group("bridges", GroupType::Bridge)])
            .await
            .unwrap();
        assert!(manager.exists_at_least_one_group().await.unwrap());

        // A second seed pass with different content is ignored.
        manager
            .apply_seed_groups(&[test_group("gateways", GroupType::Gateway)])
            .await
            .unwrap();
        assert!(manager
            .get_instance_group("gateways")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reset_preserves_desired() {
        let env = AutoscalerEnv::for_test();
        let manager = InstanceGroupManager::new(env);

        let mut group = test_group("bridges", GroupType::Bridge);
        group.scaling_options.desired_count = 4;
        manager.upsert_instance_group(group.clone()).await.unwrap();

        // Seed carries a different desired count and template id.
        group.scaling_options.desired_count = 2;
        group.instance_configuration_id = "config-2".to_string();
        manager.reset_seed_groups(&[group]).await.unwrap();

        let stored = manager.require_instance_group("bridges").await.unwrap();
        assert_eq!(stored.scaling_options.desired_count, 4);
        assert_eq!(stored.instance_configuration_id, "config-2");
    }
}
