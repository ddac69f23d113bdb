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

//! The per-group scaling decision. The autoscaler owns the desired count;
//! convergence of the live population toward it belongs to the launcher.

use std::sync::Arc;

use fleetscale_common::util::time::now_ms;

use crate::audit::{AuditRef, AutoscalerActionEvent, AutoscalerActionType};
use crate::error::AutoscalerResult;
use crate::manager::{AutoscalerEnv, InstanceGroupManagerRef, InstanceTracker, InstanceTrackerRef};
use crate::model::{InstanceGroup, ScalingFamily, ScalingOptions};
use crate::storage;

pub type AutoscaleProcessorRef = Arc<AutoscaleProcessor>;

pub struct AutoscaleProcessor {
    env: AutoscalerEnv,
    tracker: InstanceTrackerRef,
    group_manager: InstanceGroupManagerRef,
    audit: AuditRef,
}

impl AutoscaleProcessor {
    pub fn new(
        env: AutoscalerEnv,
        tracker: InstanceTrackerRef,
        group_manager: InstanceGroupManagerRef,
        audit: AuditRef,
    ) -> Self {
        Self {
            env,
            tracker,
            group_manager,
            audit,
        }
    }

    /// One autoscaler pass over `group_name`, under the group lock.
    ///
    /// `Ok(false)` means the pass was skipped (lock, toggles, grace, empty
    /// inventory); `Ok(true)` means the group was evaluated, whether or
    /// not the desired count changed.
    pub async fn process_autoscaling_by_group(&self, group_name: &str) -> AutoscalerResult<bool> {
        let lock = match self.env.lock_manager().lock_group(group_name).await {
            Ok(lock) => lock,
            Err(storage::Error::LockUnavailable(key)) => {
                tracing::warn!("group {} is locked ({}), skipping autoscale pass", group_name, key);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let result = self.process_locked(group_name).await;
        lock.release().await;
        result
    }

    async fn process_locked(&self, group_name: &str) -> AutoscalerResult<bool> {
        let group = self.group_manager.require_instance_group(group_name).await?;
        if !group.enable_auto_scale {
            tracing::info!("autoscaling disabled for group {}", group_name);
            return Ok(false);
        }
        if !self.group_manager.allow_autoscaling(group_name).await? {
            tracing::info!("group {} is in its autoscale grace period", group_name);
            return Ok(false);
        }

        self.audit.update_last_autoscaler_run(group_name).await?;

        let inventory = self.tracker.trim_current(&group, true).await?;
        let count = inventory.len() as u32;
        if count == 0 {
            tracing::info!("group {} has no live instances, nothing to evaluate", group_name);
            return Ok(false);
        }

        let desired = group.scaling_options.desired_count;
        if count != desired {
            // The launcher has not converged yet; adjusting the target on
            // top of a moving population would double-count.
            tracing::info!(
                "group {} has {} live instance(s) but desires {}, waiting for launcher",
                group_name,
                count,
                desired
            );
            return Ok(true);
        }

        let periods = group.scaling_options.evaluation_periods() as usize;
        let buckets = self
            .tracker
            .get_metric_inventory_per_period(
                group_name,
                periods,
                group.scaling_options.scale_period_sec,
            )
            .await?;
        let summaries = InstanceTracker::get_summary_metric_per_period(&group, &buckets, periods);
        if summaries.iter().all(|s| s.is_none()) {
            tracing::warn!("group {} has no metric summaries, skipping evaluation", group_name);
            return Ok(true);
        }

        if let Some(window) = Self::scale_up_window(&group, count, &summaries) {
            let new_desired =
                (desired + group.scaling_options.scale_up_quantity).min(group.scaling_options.max_desired);
            self.apply_desired_change(
                &group,
                count,
                new_desired,
                AutoscalerActionType::IncreaseDesiredCount,
                window,
            )
            .await?;
        } else if let Some(window) = Self::scale_down_window(&group, count, &summaries) {
            let new_desired = desired
                .saturating_sub(group.scaling_options.scale_down_quantity)
                .max(group.scaling_options.min_desired);
            self.apply_desired_change(
                &group,
                count,
                new_desired,
                AutoscalerActionType::DecreaseDesiredCount,
                window,
            )
            .await?;
        } else {
            tracing::info!("no scaling action needed for group {}", group_name);
        }

        Ok(true)
    }

    /// One bucket's scale-up verdict. The threshold comparison flips
    /// between families: availability counts idle slack, stress measures
    /// load.
    fn bucket_wants_scale_up(
        family: ScalingFamily,
        count: u32,
        opts: &ScalingOptions,
        value: f64,
    ) -> bool {
        match family {
            ScalingFamily::Availability => {
                count < opts.min_desired
                    || (count < opts.max_desired && value < opts.scale_up_threshold)
            }
            ScalingFamily::Stress => {
                count < opts.min_desired
                    || (count < opts.max_desired && value >= opts.scale_up_threshold)
            }
        }
    }

    fn bucket_wants_scale_down(
        family: ScalingFamily,
        count: u32,
        opts: &ScalingOptions,
        value: f64,
    ) -> bool {
        match family {
            ScalingFamily::Availability => {
                count > opts.min_desired && value > opts.scale_down_threshold
            }
            ScalingFamily::Stress => {
                count > opts.min_desired && value < opts.scale_down_threshold
            }
        }
    }

    /// The newest `periods` summaries, only if every one of them exists.
    fn window(summaries: &[Option<f64>], periods: usize) -> Option<Vec<f64>> {
        if summaries.len() < periods {
            return None;
        }
        summaries[..periods].iter().copied().collect()
    }

    /// The evaluation window when every bucket in it votes for scaling
    /// up. A single disagreeing or missing bucket vetoes the action.
    fn scale_up_window(
        group: &InstanceGroup,
        count: u32,
        summaries: &[Option<f64>],
    ) -> Option<Vec<f64>> {
        let opts = &group.scaling_options;
        let window = Self::window(summaries, opts.scale_up_periods_count as usize)?;
        window
            .iter()
            .all(|value| Self::bucket_wants_scale_up(group.scaling_family(), count, opts, *value))
            .then_some(window)
    }

    fn scale_down_window(
        group: &InstanceGroup,
        count: u32,
        summaries: &[Option<f64>],
    ) -> Option<Vec<f64>> {
        let opts = &group.scaling_options;
        let window = Self::window(summaries, opts.scale_down_periods_count as usize)?;
        window
            .iter()
            .all(|value| Self::bucket_wants_scale_down(group.scaling_family(), count, opts, *value))
            .then_some(window)
    }

    /// Audit first, then persist, then arm the grace period, so a replay
    /// always sees the cause before the effect.
    async fn apply_desired_change(
        &self,
        group: &InstanceGroup,
        count: u32,
        new_desired: u32,
        action_type: AutoscalerActionType,
        window: Vec<f64>,
    ) -> AutoscalerResult<()> {
        let old_desired = group.scaling_options.desired_count;
        self.audit
            .log_autoscaler_action(
                &group.name,
                AutoscalerActionEvent {
                    timestamp_ms: now_ms(),
                    action_type,
                    count,
                    old_desired_count: old_desired,
                    new_desired_count: new_desired,
                    scale_metrics: window,
                },
            )
            .await?;

        let mut updated = group.clone();
        updated.scaling_options.set_desired(new_desired);
        self.group_manager.upsert_instance_group(updated).await?;
        self.group_manager.set_auto_scale_grace_period(group).await?;

        tracing::info!(
            "group {} desired count {} -> {} ({:?})",
            group.name,
            old_desired,
            new_desired,
            action_type
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::Audit;
    use crate::manager::{InstanceGroupManager, ShutdownManager};
    use crate::model::{GroupType, InstanceMetric};
    use crate::storage::keys;
    use crate::test_utils::{stats_report, test_group};

    struct Fixture {
        env: AutoscalerEnv,
        processor: AutoscaleProcessor,
        group_manager: InstanceGroupManagerRef,
        audit: AuditRef,
    }

    fn fixture() -> Fixture {
        let env = AutoscalerEnv::for_test();
        let audit = Arc::new(Audit::new(&env));
        let shutdown_manager = Arc::new(ShutdownManager::new(env.clone(), audit.clone()));
        let tracker = Arc::new(InstanceTracker::new(
            env.clone(),
            shutdown_manager,
            audit.clone(),
        ));
        let group_manager = Arc::new(InstanceGroupManager::new(env.clone()));
        let processor = AutoscaleProcessor::new(
            env.clone(),
            tracker,
            group_manager.clone(),
            audit.clone(),
        );
        Fixture {
            env,
            processor,
            group_manager,
            audit,
        }
    }

    /// A stress group with two instances reporting, inventory matching
    /// desired, and `periods` buckets of history at `stress` level.
    async fn seed_stress_group(fixture: &Fixture, stress: f64) -> InstanceGroup {
        let mut group = test_group("bridges", GroupType::Bridge);
        group.scaling_options.min_desired = 1;
        group.scaling_options.max_desired = 3;
        group.scaling_options.desired_count = 2;
        fixture
            .group_manager
            .upsert_instance_group(group.clone())
            .await
            .unwrap();

        for id in ["i-1", "i-2"] {
            let report = stats_report(
                id,
                GroupType::Bridge,
                "bridges",
                serde_json::json!({ "stress_level": stress }),
            );
            fixture.processor.tracker.stats(report, false).await.unwrap();
        }
        // Backfill the older evaluation bucket.
        for id in ["i-1", "i-2"] {
            let metric = InstanceMetric {
                instance_id: id.to_string(),
                timestamp_ms: fleetscale_common::util::time::now_ms() - 65_000,
                value: stress,
            };
            fixture
                .env
                .store()
                .write_instance_metric("bridges", &metric, fixture.env.opts().metric_ttl)
                .await
                .unwrap();
        }
        fixture.group_manager.require_instance_group("bridges").await.unwrap()
    }

    #[tokio::test]
    async fn test_scale_up_on_sustained_stress() {
        let fixture = fixture();
        seed_stress_group(&fixture, 0.9).await;

        assert!(fixture
            .processor
            .process_autoscaling_by_group("bridges")
            .await
            .unwrap());

        let group = fixture
            .group_manager
            .require_instance_group("bridges")
            .await
            .unwrap();
        assert_eq!(group.scaling_options.desired_count, 3);

        let audit = fixture.audit.generate_audit("bridges").await.unwrap();
        let action = audit.autoscaler_action.unwrap();
        assert_eq!(action.action_type, AutoscalerActionType::IncreaseDesiredCount);
        assert_eq!(action.old_desired_count, 2);
        assert_eq!(action.new_desired_count, 3);
        assert_eq!(action.scale_metrics, vec![0.9, 0.9]);

        // The grace period suppresses an immediate follow-up adjustment.
        assert!(!fixture
            .processor
            .process_autoscaling_by_group("bridges")
            .await
            .unwrap());
        let group = fixture
            .group_manager
            .require_instance_group("bridges")
            .await
            .unwrap();
        assert_eq!(group.scaling_options.desired_count, 3);
    }

    #[tokio::test]
    async fn test_scale_down_on_idle_recorders() {
        let fixture = fixture();
        let mut group = test_group("recorders", GroupType::Recorder);
        group.scaling_options.min_desired = 1;
        group.scaling_options.max_desired = 5;
        group.scaling_options.desired_count = 3;
        group.scaling_options.scale_down_threshold = 2.0;
        fixture
            .group_manager
            .upsert_instance_group(group)
            .await
            .unwrap();

        for id in ["i-1", "i-2", "i-3"] {
            let report = stats_report(
                id,
                GroupType::Recorder,
                "recorders",
                serde_json::json!({"status": {"busyStatus": "IDLE", "health": "HEALTHY"}}),
            );
            fixture.processor.tracker.stats(report, false).await.unwrap();
            let metric = InstanceMetric {
                instance_id: id.to_string(),
                timestamp_ms: fleetscale_common::util::time::now_ms() - 65_000,
                value: 1.0,
            };
            fixture
                .env
                .store()
                .write_instance_metric("recorders", &metric, fixture.env.opts().metric_ttl)
                .await
                .unwrap();
        }

        assert!(fixture
            .processor
            .process_autoscaling_by_group("recorders")
            .await
            .unwrap());

        // Three idle recorders sum to 3 > threshold 2 in both windows.
        let group = fixture
            .group_manager
            .require_instance_group("recorders")
            .await
            .unwrap();
        assert_eq!(group.scaling_options.desired_count, 2);
        let audit = fixture.audit.generate_audit("recorders").await.unwrap();
        assert_eq!(
            audit.autoscaler_action.unwrap().action_type,
            AutoscalerActionType::DecreaseDesiredCount
        );
    }

    #[tokio::test]
    async fn test_single_bucket_cannot_trigger() {
        let fixture = fixture();
        let mut group = test_group("bridges", GroupType::Bridge);
        group.scaling_options.desired_count = 2;
        group.scaling_options.max_desired = 3;
        fixture
            .group_manager
            .upsert_instance_group(group)
            .await
            .unwrap();

        // Only the newest bucket is hot; the older one has no data, so
        // the two-bucket window cannot agree.
        for id in ["i-1", "i-2"] {
            let report = stats_report(
                id,
                GroupType::Bridge,
                "bridges",
                serde_json::json!({ "stress_level": 0.95 }),
            );
            fixture.processor.tracker.stats(report, false).await.unwrap();
        }

        assert!(fixture
            .processor
            .process_autoscaling_by_group("bridges")
            .await
            .unwrap());
        let group = fixture
            .group_manager
            .require_instance_group("bridges")
            .await
            .unwrap();
        assert_eq!(group.scaling_options.desired_count, 2);
        assert!(fixture
            .audit
            .generate_audit("bridges")
            .await
            .unwrap()
            .autoscaler_action
            .is_none());
    }

    #[tokio::test]
    async fn test_wait_for_launcher_emits_nothing() {
        let fixture = fixture();
        let mut group = test_group("bridges", GroupType::Bridge);
        group.scaling_options.desired_count = 3;
        fixture
            .group_manager
            .upsert_instance_group(group)
            .await
            .unwrap();

        // Two live instances against a desired count of three.
        for id in ["i-1", "i-2"] {
            let report = stats_report(
                id,
                GroupType::Bridge,
                "bridges",
                serde_json::json!({ "stress_level": 0.9 }),
            );
            fixture.processor.tracker.stats(report, false).await.unwrap();
        }

        // The pass reports success without acting.
        assert!(fixture
            .processor
            .process_autoscaling_by_group("bridges")
            .await
            .unwrap());
        assert!(fixture
            .audit
            .generate_audit("bridges")
            .await
            .unwrap()
            .autoscaler_action
            .is_none());
        // No grace key was armed either.
        assert!(fixture
            .group_manager
            .allow_autoscaling("bridges")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_disabled_group_is_skipped() {
        let fixture = fixture();
        let mut group = test_group("bridges", GroupType::Bridge);
        group.enable_auto_scale = false;
        fixture
            .group_manager
            .upsert_instance_group(group)
            .await
            .unwrap();
        assert!(!fixture
            .processor
            .process_autoscaling_by_group("bridges")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_missing_group_fails() {
        let fixture = fixture();
        assert!(matches!(
            fixture.processor.process_autoscaling_by_group("nope").await,
            Err(crate::error::AutoscalerError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_locked_group_is_skipped() {
        let fixture = fixture();
        seed_stress_group(&fixture, 0.9).await;

        let held = fixture.env.lock_manager().lock_group("bridges").await.unwrap();
        assert!(!fixture
            .processor
            .process_autoscaling_by_group("bridges")
            .await
            .unwrap());
        held.release().await;
    }

    #[tokio::test]
    async fn test_desired_capped_at_max() {
        let fixture = fixture();
        let mut group = seed_stress_group(&fixture, 0.9).await;
        group.scaling_options.scale_up_quantity = 10;
        fixture
            .group_manager
            .upsert_instance_group(group)
            .await
            .unwrap();

        assert!(fixture
            .processor
            .process_autoscaling_by_group("bridges")
            .await
            .unwrap());
        let group = fixture
            .group_manager
            .require_instance_group("bridges")
            .await
            .unwrap();
        assert_eq!(group.scaling_options.desired_count, 3);
    }

    #[tokio::test]
    async fn test_availability_threshold_direction() {
        let group = test_group("recorders", GroupType::Recorder);
        let opts = &group.scaling_options;
        // Few idle recorders: scale up.
        assert!(AutoscaleProcessor::bucket_wants_scale_up(
            ScalingFamily::Availability,
            2,
            opts,
            0.2
        ));
        // Plenty idle: no scale-up, and above the down threshold the
        // group shrinks.
        assert!(!AutoscaleProcessor::bucket_wants_scale_up(
            ScalingFamily::Availability,
            2,
            opts,
            3.0
        ));
        assert!(AutoscaleProcessor::bucket_wants_scale_down(
            ScalingFamily::Availability,
            2,
            opts,
            3.0
        ));
        // Stress flips both comparisons.
        assert!(AutoscaleProcessor::bucket_wants_scale_up(
            ScalingFamily::Stress,
            2,
            opts,
            0.9
        ));
        assert!(AutoscaleProcessor::bucket_wants_scale_down(
            ScalingFamily::Stress,
            2,
            opts,
            0.1
        ));
    }

    #[tokio::test]
    async fn test_grace_period_expiry_reenables() {
        let fixture = fixture();
        let mut group = seed_stress_group(&fixture, 0.9).await;
        group.grace_period_ttl_sec = 0;
        fixture
            .group_manager
            .upsert_instance_group(group)
            .await
            .unwrap();

        assert!(fixture
            .processor
            .process_autoscaling_by_group("bridges")
            .await
            .unwrap());
        // With a zero TTL the grace key is already gone.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fixture
            .group_manager
            .allow_autoscaling("bridges")
            .await
            .unwrap());
        // The grace key itself was written.
        assert!(fixture
            .env
            .store()
            .get_value(&keys::autoscale_grace("bridges"))
            .await
            .unwrap()
            .is_none());
    }
}
