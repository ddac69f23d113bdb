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

use fleetscale_common::config::FleetscaleConfig;

use crate::metrics::AutoscalerMetrics;
#[cfg(test)]
use crate::storage::MemStore;
use crate::storage::{InstanceStoreRef, LockManager, LockManagerRef, StateTtlPolicy};

/// Options shared by every control-plane component, resolved once at boot
/// from [`FleetscaleConfig`].
#[derive(Clone, Debug)]
pub struct AutoscalerOpts {
    /// Cadence of the job producer.
    pub autoscaler_interval: Duration,
    /// Grace armed after each successful group-job production pass.
    pub group_jobs_creation_grace_period: Duration,
    /// Grace armed after each successful sanity-job production pass.
    pub sanity_jobs_creation_grace_period: Duration,

    pub autoscaler_processing_timeout: Duration,
    pub launcher_processing_timeout: Duration,
    pub sanity_loop_processing_timeout: Duration,
    pub consumers_per_queue: usize,
    pub metrics_loop_interval: Duration,

    pub group_lock_ttl: Duration,
    pub job_creation_lock_ttl: Duration,

    pub idle_ttl: Duration,
    pub provisioning_ttl: Duration,
    pub shutdown_status_ttl: Duration,
    pub metric_ttl: Duration,
    pub audit_ttl: Duration,
    pub group_related_data_ttl: Duration,
    pub service_level_metrics_ttl: Duration,
    pub shutdown_ttl: Duration,
    pub reconfigure_ttl: Duration,

    /// Cap on the untracked-instance launch throttle threshold.
    pub max_throttle_threshold: u32,
    /// Record launcher intent without touching the fleet.
    pub dry_run: bool,

    pub report_ext_call_max_time: Duration,
    pub report_ext_call_max_delay: Duration,
    pub report_ext_call_retryable_status_codes: Vec<u16>,
}

impl AutoscalerOpts {
    pub fn from_config(config: &FleetscaleConfig) -> Self {
        Self {
            autoscaler_interval: Duration::from_secs(config.jobs.autoscaler_interval_sec),
            group_jobs_creation_grace_period: Duration::from_secs(
                config.jobs.group_jobs_creation_grace_period_sec,
            ),
            sanity_jobs_creation_grace_period: Duration::from_secs(
                config.jobs.sanity_jobs_creation_grace_period_sec,
            ),
            autoscaler_processing_timeout: Duration::from_millis(
                config.jobs.autoscaler_processing_timeout_ms,
            ),
            launcher_processing_timeout: Duration::from_millis(
                config.jobs.launcher_processing_timeout_ms,
            ),
            sanity_loop_processing_timeout: Duration::from_millis(
                config.jobs.sanity_loop_processing_timeout_ms,
            ),
            consumers_per_queue: config.jobs.consumers_per_queue,
            metrics_loop_interval: Duration::from_secs(config.jobs.metrics_loop_interval_sec),
            group_lock_ttl: Duration::from_millis(config.locks.group_lock_ttl_ms),
            job_creation_lock_ttl: Duration::from_millis(config.locks.job_creation_lock_ttl_ms),
            idle_ttl: Duration::from_secs(config.ttl.idle_ttl_sec),
            provisioning_ttl: Duration::from_secs(config.ttl.provisioning_ttl_sec),
            shutdown_status_ttl: Duration::from_secs(config.ttl.shutdown_status_ttl_sec),
            metric_ttl: Duration::from_secs(config.ttl.metric_ttl_sec),
            audit_ttl: Duration::from_secs(config.ttl.audit_ttl_sec),
            group_related_data_ttl: Duration::from_secs(config.ttl.group_related_data_ttl_sec),
            service_level_metrics_ttl: Duration::from_secs(
                config.ttl.service_level_metrics_ttl_sec,
            ),
            shutdown_ttl: Duration::from_secs(config.ttl.shutdown_ttl_sec),
            reconfigure_ttl: Duration::from_secs(config.ttl.reconfigure_ttl_sec),
            max_throttle_threshold: config.launcher.max_throttle_threshold,
            dry_run: config.launcher.dry_run,
            report_ext_call_max_time: Duration::from_secs(config.cloud.report_ext_call_max_time_sec),
            report_ext_call_max_delay: Duration::from_secs(
                config.cloud.report_ext_call_max_delay_sec,
            ),
            report_ext_call_retryable_status_codes: config
                .cloud
                .report_ext_call_retryable_status_codes
                .clone(),
        }
    }

    pub fn state_ttl_policy(&self) -> StateTtlPolicy {
        StateTtlPolicy {
            idle_ttl: self.idle_ttl,
            provisioning_ttl: self.provisioning_ttl,
            shutdown_status_ttl: self.shutdown_status_ttl,
        }
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self::from_config(&FleetscaleConfig::default())
    }
}

/// [`AutoscalerEnv`] is the global environment of the control plane; the
/// instance is shared by all managers and loops.
#[derive(Clone)]
pub struct AutoscalerEnv {
    store: InstanceStoreRef,
    lock_manager: LockManagerRef,
    metrics: Arc<AutoscalerMetrics>,
    opts: Arc<AutoscalerOpts>,
}

impl AutoscalerEnv {
    pub fn new(store: InstanceStoreRef, opts: AutoscalerOpts) -> Self {
        let lock_manager = Arc::new(LockManager::new(
            store.clone(),
            opts.group_lock_ttl,
            opts.job_creation_lock_ttl,
        ));
        Self {
            store,
            lock_manager,
            metrics: Arc::new(AutoscalerMetrics::new()),
            opts: Arc::new(opts),
        }
    }

    pub fn store(&self) -> InstanceStoreRef {
        self.store.clone()
    }

    pub fn store_ref(&self) -> &InstanceStoreRef {
        &self.store
    }

    pub fn lock_manager(&self) -> LockManagerRef {
        self.lock_manager.clone()
    }

    pub fn metrics(&self) -> Arc<AutoscalerMetrics> {
        self.metrics.clone()
    }

    pub fn opts(&self) -> &AutoscalerOpts {
        &self.opts
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self::new(Arc::new(MemStore::new()), AutoscalerOpts::for_test())
    }

    #[cfg(test)]
    pub fn for_test_with_opts(opts: AutoscalerOpts) -> Self {
        Self::new(Arc::new(MemStore::new()), opts)
    }
}
