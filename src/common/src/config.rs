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

//! Configuration of the fleetscale control plane, loaded from a TOML file.
//!
//! Every field is defaulted, so an empty (or absent) file yields a working
//! single-process configuration backed by the in-memory store.

use std::fs;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Load configuration from `path`. An empty path yields the defaults.
pub fn load_config(path: &str) -> anyhow::Result<FleetscaleConfig> {
    if path.is_empty() {
        tracing::warn!("no config file specified, using default config");
        return Ok(FleetscaleConfig::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse {}", path))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FleetscaleConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub locks: LocksConfig,

    #[serde(default)]
    pub ttl: TtlConfig,

    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub groups: GroupsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP service (side-car, admin and Prometheus
    /// exposition) binds to.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store backend, either `mem` or `redis`.
    pub backend: StoreBackendKind,

    /// Redis connection URL, required for the `redis` backend.
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Mem,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Mem,
    Redis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Cadence of the job producer, in seconds.
    pub autoscaler_interval_sec: u64,

    /// Grace period armed after each successful group-job production pass,
    /// in seconds.
    pub group_jobs_creation_grace_period_sec: u64,

    /// Grace period armed after each successful sanity-job production pass,
    /// in seconds.
    pub sanity_jobs_creation_grace_period_sec: u64,

    /// Wall-clock timeout of one autoscaler job, in milliseconds.
    pub autoscaler_processing_timeout_ms: u64,

    /// Wall-clock timeout of one launcher job, in milliseconds.
    pub launcher_processing_timeout_ms: u64,

    /// Wall-clock timeout of one sanity job, in milliseconds.
    pub sanity_loop_processing_timeout_ms: u64,

    /// Consumer workers per queue.
    pub consumers_per_queue: usize,

    /// Cadence of the Prometheus gauge refresh loop, in seconds.
    pub metrics_loop_interval_sec: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            autoscaler_interval_sec: 10,
            group_jobs_creation_grace_period_sec: 30,
            sanity_jobs_creation_grace_period_sec: 50,
            autoscaler_processing_timeout_ms: 60_000,
            launcher_processing_timeout_ms: 60_000,
            sanity_loop_processing_timeout_ms: 60_000,
            consumers_per_queue: 2,
            metrics_loop_interval_sec: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// Lifetime of a per-group processing lock, in milliseconds.
    pub group_lock_ttl_ms: u64,

    /// Lifetime of the global job-creation lock, in milliseconds.
    pub job_creation_lock_ttl_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            group_lock_ttl_ms: 180_000,
            job_creation_lock_ttl_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// How long a running instance stays in inventory without a report,
    /// in seconds.
    pub idle_ttl_sec: u64,

    /// How long a provisioning instance stays in inventory before its first
    /// report, in seconds.
    pub provisioning_ttl_sec: u64,

    /// How long a shutting-down instance stays in inventory, in seconds.
    pub shutdown_status_ttl_sec: u64,

    /// Retention of per-instance metric points, in seconds.
    pub metric_ttl_sec: u64,

    /// Retention of audit events, in seconds.
    pub audit_ttl_sec: u64,

    /// Retention of miscellaneous per-group data, in seconds.
    pub group_related_data_ttl_sec: u64,

    /// Retention of the per-group untracked-count key, in seconds.
    pub service_level_metrics_ttl_sec: u64,

    /// Lifetime of shutdown markers and confirmations, in seconds.
    pub shutdown_ttl_sec: u64,

    /// Lifetime of reconfigure markers, in seconds.
    pub reconfigure_ttl_sec: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            idle_ttl_sec: 90,
            provisioning_ttl_sec: 420,
            shutdown_status_ttl_sec: 86_400,
            metric_ttl_sec: 3_600,
            audit_ttl_sec: 172_800,
            group_related_data_ttl_sec: 172_800,
            service_level_metrics_ttl_sec: 600,
            shutdown_ttl_sec: 86_400,
            reconfigure_ttl_sec: 86_400,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Cap on the untracked-instance launch throttle threshold.
    pub max_throttle_threshold: u32,

    /// When set, the launcher records intent but no instance is launched or
    /// marked for shutdown.
    pub dry_run: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            max_throttle_threshold: 40,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Enabled cloud adapters, keyed by the `cloud` field of a group.
    pub providers: Vec<String>,

    /// Total time budget of a cloud enumeration call, in seconds.
    pub report_ext_call_max_time_sec: u64,

    /// Cap on the delay between enumeration retries, in seconds.
    pub report_ext_call_max_delay_sec: u64,

    /// HTTP status codes the enumeration retry loop treats as transient.
    pub report_ext_call_retryable_status_codes: Vec<u16>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            providers: vec!["sim".to_string()],
            report_ext_call_max_time_sec: 60,
            report_ext_call_max_delay_sec: 30,
            report_ext_call_retryable_status_codes: vec![404, 409, 429, 500, 502, 503, 504],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupsConfig {
    /// Path of a JSON file holding the initial group definitions. Applied
    /// only when the store holds no group at all.
    pub seed_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = load_config("").unwrap();
        assert_eq!(config.jobs.autoscaler_interval_sec, 10);
        assert_eq!(config.launcher.max_throttle_threshold, 40);
        assert_eq!(config.store.backend, StoreBackendKind::Mem);
    }

    #[test]
    fn test_partial_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[launcher]
max_throttle_threshold = 12
dry_run = true

[store]
backend = "redis"
"#
        )
        .unwrap();
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.launcher.max_throttle_threshold, 12);
        assert!(config.launcher.dry_run);
        assert_eq!(config.store.backend, StoreBackendKind::Redis);
        // Untouched sections keep their defaults.
        assert_eq!(config.ttl.idle_ttl_sec, 90);
    }

    #[test]
    fn test_parse_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not = [valid").unwrap();
        assert!(load_config(file.path().to_str().unwrap()).is_err());
    }
}
