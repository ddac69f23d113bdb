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

//! Reconfigure intent markers, same scheme as shutdown: mark with a TTL,
//! let the side-car poll, clear once it reports a completion at or after
//! the stored date.

use std::sync::Arc;

use fleetscale_common::util::time::now_rfc3339;

use crate::audit::AuditRef;
use crate::error::AutoscalerResult;
use crate::manager::AutoscalerEnv;
use crate::model::InstanceId;

pub type ReconfigureManagerRef = Arc<ReconfigureManager>;

pub struct ReconfigureManager {
    env: AutoscalerEnv,
    audit: AuditRef,
}

impl ReconfigureManager {
    pub fn new(env: AutoscalerEnv, audit: AuditRef) -> Self {
        Self { env, audit }
    }

    /// Schedule a reconfigure of every id, stamped with the current time.
    pub async fn set_reconfigure_dates(
        &self,
        group: &str,
        ids: &[InstanceId],
    ) -> AutoscalerResult<String> {
        let date = now_rfc3339();
        self.env
            .store()
            .set_reconfigure_dates(ids, &date, self.env.opts().reconfigure_ttl)
            .await?;
        for id in ids {
            self.audit.log_reconfigure(group, id, &date).await?;
        }
        Ok(date)
    }

    pub async fn get_reconfigure_date(&self, id: &str) -> AutoscalerResult<Option<String>> {
        Ok(self.env.store().get_reconfigure_date(id).await?)
    }

    pub async fn get_reconfigure_dates(
        &self,
        ids: &[InstanceId],
    ) -> AutoscalerResult<Vec<Option<String>>> {
        Ok(self.env.store().get_reconfigure_dates(ids).await?)
    }

    pub async fn unset_reconfigure_date(&self, group: &str, id: &str) -> AutoscalerResult<()> {
        self.env.store().unset_reconfigure_date(id).await?;
        self.audit.log_unset_reconfigure(group, id).await
    }

    /// Handle a side-car's `reconfigureComplete` report: the marker is
    /// cleared once the completion reaches the stored date.
    pub async fn process_completion(
        &self,
        group: &str,
        id: &str,
        reconfigure_complete: &str,
    ) -> AutoscalerResult<()> {
        let Some(stored) = self.get_reconfigure_date(id).await? else {
            return Ok(());
        };
        let (Ok(completed), Ok(scheduled)) = (
            chrono::DateTime::parse_from_rfc3339(reconfigure_complete),
            chrono::DateTime::parse_from_rfc3339(&stored),
        ) else {
            tracing::warn!(
                "unparseable reconfigure dates for instance {}: complete={}, stored={}",
                id,
                reconfigure_complete,
                stored
            );
            return Ok(());
        };
        if completed >= scheduled {
            self.unset_reconfigure_date(group, id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Audit;

    #[tokio::test]
    async fn test_completion_clears_marker() {
        let env = AutoscalerEnv::for_test();
        let audit = Arc::new(Audit::new(&env));
        let manager = ReconfigureManager::new(env.clone(), audit.clone());

        let ids = vec!["i-1".to_string()];
        let date = manager.set_reconfigure_dates("g", &ids).await.unwrap();
        assert_eq!(
            manager.get_reconfigure_date("i-1").await.unwrap(),
            Some(date.clone())
        );

        // A completion earlier than the scheduled date does not clear.
        manager
            .process_completion("g", "i-1", "2000-01-01T00:00:00+00:00")
            .await
            .unwrap();
        assert!(manager.get_reconfigure_date("i-1").await.unwrap().is_some());

        // Completion at the stored date clears the marker and audits it.
        manager.process_completion("g", "i-1", &date).await.unwrap();
        assert!(manager.get_reconfigure_date("i-1").await.unwrap().is_none());

        let generated = audit.generate_audit("g").await.unwrap();
        let record = &generated.instances[0];
        assert!(record.reconfigure.is_some());
        assert!(record.unset_reconfigure.is_some());
    }

    #[tokio::test]
    async fn test_completion_without_marker_is_noop() {
        let env = AutoscalerEnv::for_test();
        let audit = Arc::new(Audit::new(&env));
        let manager = ReconfigureManager::new(env, audit);
        manager
            .process_completion("g", "i-unknown", &now_rfc3339())
            .await
            .unwrap();
    }
}
