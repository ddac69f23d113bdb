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

//! Shutdown intent markers. The control plane never terminates an instance
//! directly: it marks intent here, the side-car observes the marker on its
//! next poll and exits, then the confirmation is recorded.

use std::sync::Arc;

use crate::audit::AuditRef;
use crate::error::AutoscalerResult;
use crate::manager::AutoscalerEnv;
use crate::model::InstanceId;

pub type ShutdownManagerRef = Arc<ShutdownManager>;

pub struct ShutdownManager {
    env: AutoscalerEnv,
    audit: AuditRef,
}

impl ShutdownManager {
    pub fn new(env: AutoscalerEnv, audit: AuditRef) -> Self {
        Self { env, audit }
    }

    /// Mark shutdown intent on every id. Idempotent: re-marking refreshes
    /// the marker TTL.
    pub async fn set_shutdown_statuses(
        &self,
        group: &str,
        ids: &[InstanceId],
    ) -> AutoscalerResult<()> {
        self.env
            .store()
            .set_shutdown_statuses(ids, self.env.opts().shutdown_ttl)
            .await?;
        for id in ids {
            self.audit.log_request_to_terminate(group, id).await?;
        }
        tracing::info!("marked {} instance(s) of group {} for shutdown", ids.len(), group);
        Ok(())
    }

    pub async fn get_shutdown_status(&self, id: &str) -> AutoscalerResult<bool> {
        Ok(self.env.store().get_shutdown_status(id).await?)
    }

    pub async fn get_shutdown_statuses(&self, ids: &[InstanceId]) -> AutoscalerResult<Vec<bool>> {
        Ok(self.env.store().get_shutdown_statuses(ids).await?)
    }

    /// Record the side-car's confirmation that it is going away.
    pub async fn set_shutdown_confirmation(
        &self,
        group: &str,
        id: &str,
        confirmed_at: &str,
    ) -> AutoscalerResult<()> {
        let ids = [id.to_string()];
        self.env
            .store()
            .set_shutdown_confirmations(&ids, confirmed_at, self.env.opts().shutdown_ttl)
            .await?;
        self.audit
            .log_shutdown_confirmation(group, id, confirmed_at)
            .await
    }

    pub async fn get_shutdown_confirmation(&self, id: &str) -> AutoscalerResult<Option<String>> {
        Ok(self.env.store().get_shutdown_confirmation(id).await?)
    }

    pub async fn get_shutdown_confirmations(
        &self,
        ids: &[InstanceId],
    ) -> AutoscalerResult<Vec<Option<String>>> {
        Ok(self.env.store().get_shutdown_confirmations(ids).await?)
    }
}
