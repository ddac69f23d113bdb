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

//! Cloud adapter capability and the per-cloud selector. Concrete providers
//! plug in behind [`CloudInstanceManager`]; the rest of the control plane
//! only sees the selector.

mod pool;
mod sim;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

pub use pool::{InstancePool, PoolCloudManager};
pub use sim::SimulatedCloudManager;

use crate::error::{AutoscalerError, AutoscalerResult};
use crate::manager::AutoscalerOpts;
use crate::model::{InstanceGroup, InstanceState};

pub type CloudInstanceManagerRef = Arc<dyn CloudInstanceManager>;
pub type CloudManagerRef = Arc<CloudManager>;

/// One cloud-visible instance, as enumerated by a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudInstance {
    pub instance_id: String,
    pub display_name: String,
    pub cloud_status: String,
}

impl CloudInstance {
    pub fn is_terminated(&self) -> bool {
        self.cloud_status.eq_ignore_ascii_case("terminated")
    }

    /// Provisioning or running; the states that make an unreported
    /// instance count as untracked.
    pub fn is_active(&self) -> bool {
        self.cloud_status.eq_ignore_ascii_case("provisioning")
            || self.cloud_status.eq_ignore_ascii_case("running")
    }
}

/// Retry policy of cloud enumeration calls. Retries live inside adapters;
/// callers see only the final outcome.
#[derive(Clone, Debug)]
pub struct CloudRetryStrategy {
    pub max_time: Duration,
    pub max_delay: Duration,
    pub retryable_status_codes: Vec<u16>,
}

impl CloudRetryStrategy {
    pub fn from_opts(opts: &AutoscalerOpts) -> Self {
        Self {
            max_time: opts.report_ext_call_max_time,
            max_delay: opts.report_ext_call_max_delay,
            retryable_status_codes: opts.report_ext_call_retryable_status_codes.clone(),
        }
    }
}

/// Exponential backoff driven by a [`CloudRetryStrategy`], for adapters
/// whose provider calls are transiently flaky.
pub async fn call_with_retry<T, F, Fut>(retry: &CloudRetryStrategy, mut call: F) -> AutoscalerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AutoscalerResult<T>>,
{
    let deadline = Instant::now() + retry.max_time;
    let mut delay = Duration::from_secs(1);
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e @ AutoscalerError::Cloud(_)) => {
                if Instant::now() + delay >= deadline {
                    return Err(e);
                }
                tracing::warn!("cloud call failed, retrying in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(retry.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
pub trait CloudInstanceManager: Send + Sync {
    /// Launch `quantity` instances for `group`. Returns one entry per
    /// attempt, `None` marking a failed attempt; failures never abort the
    /// remaining attempts.
    async fn launch_instances(
        &self,
        group: &InstanceGroup,
        current_inventory: &[InstanceState],
        quantity: u32,
    ) -> AutoscalerResult<Vec<Option<String>>>;

    /// Enumerate cloud-visible instances of the group. Callers filter
    /// terminated entries themselves.
    async fn get_instances(
        &self,
        group: &InstanceGroup,
        retry: &CloudRetryStrategy,
    ) -> AutoscalerResult<Vec<CloudInstance>>;
}

/// Adapter selector keyed by the `cloud` field of a group.
pub struct CloudManager {
    adapters: HashMap<String, CloudInstanceManagerRef>,
}

impl CloudManager {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn with_adapter(mut self, cloud: &str, adapter: CloudInstanceManagerRef) -> Self {
        self.adapters.insert(cloud.to_string(), adapter);
        self
    }

    fn adapter(&self, cloud: &str) -> AutoscalerResult<&CloudInstanceManagerRef> {
        self.adapters
            .get(cloud)
            .ok_or_else(|| AutoscalerError::Cloud(format!("no adapter for cloud {}", cloud)))
    }

    pub async fn launch_instances(
        &self,
        group: &InstanceGroup,
        current_inventory: &[InstanceState],
        quantity: u32,
    ) -> AutoscalerResult<Vec<Option<String>>> {
        self.adapter(&group.cloud)?
            .launch_instances(group, current_inventory, quantity)
            .await
    }

    pub async fn get_instances(
        &self,
        group: &InstanceGroup,
        retry: &CloudRetryStrategy,
    ) -> AutoscalerResult<Vec<CloudInstance>> {
        self.adapter(&group.cloud)?.get_instances(group, retry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_group;
    use crate::model::GroupType;

    #[tokio::test]
    async fn test_selector_rejects_unknown_cloud() {
        let manager = CloudManager::new();
        let group = test_group("g", GroupType::Bridge);
        let result = manager.get_instances(&group, &retry()).await;
        assert!(matches!(result, Err(AutoscalerError::Cloud(_))));
    }

    fn retry() -> CloudRetryStrategy {
        CloudRetryStrategy {
            max_time: Duration::from_millis(200),
            max_delay: Duration::from_millis(50),
            retryable_status_codes: vec![],
        }
    }

    #[tokio::test]
    async fn test_retry_eventually_succeeds() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = call_with_retry(&retry(), || {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AutoscalerError::Cloud("transient".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_cloud_errors() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: AutoscalerResult<()> = call_with_retry(&retry(), || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(AutoscalerError::Validation("bad".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(AutoscalerError::Validation(_))));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cloud_status_classification() {
        let instance = CloudInstance {
            instance_id: "i-1".to_string(),
            display_name: "bridge-1".to_string(),
            cloud_status: "Running".to_string(),
        };
        assert!(instance.is_active());
        assert!(!instance.is_terminated());

        let gone = CloudInstance {
            cloud_status: "Terminated".to_string(),
            ..instance
        };
        assert!(gone.is_terminated());
        assert!(!gone.is_active());
    }
}
