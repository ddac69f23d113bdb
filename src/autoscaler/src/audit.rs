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

//! TTL-bounded action log. One key per `(group, scope, kind)`, where scope
//! is an instance id or the group-wide `"group"` scope; a newer event of
//! the same kind replaces the older one, and everything ages out with
//! `audit_ttl`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleetscale_common::util::time::now_ms;
use serde::{Deserialize, Serialize};

use crate::error::AutoscalerResult;
use crate::manager::AutoscalerEnv;
use crate::model::InstanceState;
use crate::storage::{keys, InstanceStoreRef};

pub type AuditRef = Arc<Audit>;

/// Scope segment of group-wide events.
const GROUP_SCOPE: &str = "group";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoscalerActionType {
    IncreaseDesiredCount,
    DecreaseDesiredCount,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerActionEvent {
    pub timestamp_ms: u64,
    pub action_type: AutoscalerActionType,
    pub count: u32,
    pub old_desired_count: u32,
    pub new_desired_count: u32,
    /// The window of bucket summaries the decision was based on.
    pub scale_metrics: Vec<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LauncherActionType {
    ScaleUp,
    ScaleDown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherActionEvent {
    pub timestamp_ms: u64,
    pub action_type: LauncherActionType,
    pub count: u32,
    pub desired_count: u32,
    pub scale_quantity: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AuditEvent {
    LatestStatus {
        timestamp_ms: u64,
        state: InstanceState,
    },
    RequestToLaunch {
        timestamp_ms: u64,
    },
    RequestToTerminate {
        timestamp_ms: u64,
    },
    ShutdownConfirmation {
        timestamp_ms: u64,
        confirmed_at: String,
    },
    Reconfigure {
        timestamp_ms: u64,
        date: String,
    },
    UnsetReconfigure {
        timestamp_ms: u64,
    },
    AutoscalerAction(AutoscalerActionEvent),
    LauncherAction(LauncherActionEvent),
    LastAutoscalerRun {
        timestamp_ms: u64,
    },
    LastLauncherRun {
        timestamp_ms: u64,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::LatestStatus { .. } => "latest-status",
            AuditEvent::RequestToLaunch { .. } => "request-to-launch",
            AuditEvent::RequestToTerminate { .. } => "request-to-terminate",
            AuditEvent::ShutdownConfirmation { .. } => "shutdown-confirmation",
            AuditEvent::Reconfigure { .. } => "reconfigure",
            AuditEvent::UnsetReconfigure { .. } => "unset-reconfigure",
            AuditEvent::AutoscalerAction(_) => "autoscaler-action",
            AuditEvent::LauncherAction(_) => "launcher-action",
            AuditEvent::LastAutoscalerRun { .. } => "last-autoscaler-run",
            AuditEvent::LastLauncherRun { .. } => "last-launcher-run",
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            AuditEvent::LatestStatus { timestamp_ms, .. }
            | AuditEvent::RequestToLaunch { timestamp_ms }
            | AuditEvent::RequestToTerminate { timestamp_ms }
            | AuditEvent::ShutdownConfirmation { timestamp_ms, .. }
            | AuditEvent::Reconfigure { timestamp_ms, .. }
            | AuditEvent::UnsetReconfigure { timestamp_ms }
            | AuditEvent::LastAutoscalerRun { timestamp_ms }
            | AuditEvent::LastLauncherRun { timestamp_ms } => *timestamp_ms,
            AuditEvent::AutoscalerAction(e) => e.timestamp_ms,
            AuditEvent::LauncherAction(e) => e.timestamp_ms,
        }
    }
}

/// Stored envelope; the scope travels with the event so a prefix listing
/// can be regrouped without parsing keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredAuditEvent {
    scope: String,
    #[serde(flatten)]
    event: AuditEvent,
}

/// Per-instance fold of the audit log: the most recent event of each kind.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAuditRecord {
    pub instance_id: String,
    pub request_to_launch: Option<u64>,
    pub request_to_terminate: Option<u64>,
    pub shutdown_confirmation: Option<String>,
    pub reconfigure: Option<String>,
    pub unset_reconfigure: Option<u64>,
    pub latest_status: Option<InstanceState>,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAudit {
    pub last_autoscaler_run: Option<u64>,
    pub last_launcher_run: Option<u64>,
    pub autoscaler_action: Option<AutoscalerActionEvent>,
    pub launcher_action: Option<LauncherActionEvent>,
    pub instances: Vec<InstanceAuditRecord>,
}

pub struct Audit {
    store: InstanceStoreRef,
    ttl: Duration,
}

impl Audit {
    pub fn new(env: &AutoscalerEnv) -> Self {
        Self {
            store: env.store(),
            ttl: env.opts().audit_ttl,
        }
    }

    async fn log(&self, group: &str, scope: &str, event: AuditEvent) -> AutoscalerResult<()> {
        let key = keys::audit(group, scope, event.kind());
        let stored = StoredAuditEvent {
            scope: scope.to_string(),
            event,
        };
        let raw = serde_json::to_string(&stored).map_err(crate::storage::Error::from)?;
        self.store.set_value(&key, &raw, self.ttl).await?;
        Ok(())
    }

    pub async fn log_latest_status(&self, group: &str, state: &InstanceState) -> AutoscalerResult<()> {
        self.log(
            group,
            &state.instance_id,
            AuditEvent::LatestStatus {
                timestamp_ms: now_ms(),
                state: state.clone(),
            },
        )
        .await
    }

    pub async fn log_request_to_launch(&self, group: &str, instance_id: &str) -> AutoscalerResult<()> {
        self.log(
            group,
            instance_id,
            AuditEvent::RequestToLaunch {
                timestamp_ms: now_ms(),
            },
        )
        .await
    }

    pub async fn log_request_to_terminate(
        &self,
        group: &str,
        instance_id: &str,
    ) -> AutoscalerResult<()> {
        self.log(
            group,
            instance_id,
            AuditEvent::RequestToTerminate {
                timestamp_ms: now_ms(),
            },
        )
        .await
    }

    pub async fn log_shutdown_confirmation(
        &self,
        group: &str,
        instance_id: &str,
        confirmed_at: &str,
    ) -> AutoscalerResult<()> {
        self.log(
            group,
            instance_id,
            AuditEvent::ShutdownConfirmation {
                timestamp_ms: now_ms(),
                confirmed_at: confirmed_at.to_string(),
            },
        )
        .await
    }

    pub async fn log_reconfigure(
        &self,
        group: &str,
        instance_id: &str,
        date: &str,
    ) -> AutoscalerResult<()> {
        self.log(
            group,
            instance_id,
            AuditEvent::Reconfigure {
                timestamp_ms: now_ms(),
                date: date.to_string(),
            },
        )
        .await
    }

    pub async fn log_unset_reconfigure(
        &self,
        group: &str,
        instance_id: &str,
    ) -> AutoscalerResult<()> {
        self.log(
            group,
            instance_id,
            AuditEvent::UnsetReconfigure {
                timestamp_ms: now_ms(),
            },
        )
        .await
    }

    pub async fn log_autoscaler_action(
        &self,
        group: &str,
        event: AutoscalerActionEvent,
    ) -> AutoscalerResult<()> {
        self.log(group, GROUP_SCOPE, AuditEvent::AutoscalerAction(event))
            .await
    }

    pub async fn log_launcher_action(
        &self,
        group: &str,
        event: LauncherActionEvent,
    ) -> AutoscalerResult<()> {
        self.log(group, GROUP_SCOPE, AuditEvent::LauncherAction(event))
            .await
    }

    pub async fn update_last_autoscaler_run(&self, group: &str) -> AutoscalerResult<()> {
        self.log(
            group,
            GROUP_SCOPE,
            AuditEvent::LastAutoscalerRun {
                timestamp_ms: now_ms(),
            },
        )
        .await
    }

    pub async fn update_last_launcher_run(&self, group: &str) -> AutoscalerResult<()> {
        self.log(
            group,
            GROUP_SCOPE,
            AuditEvent::LastLauncherRun {
                timestamp_ms: now_ms(),
            },
        )
        .await
    }

    /// All live events of a group, folded per instance with the most
    /// recent event of each kind winning.
    pub async fn generate_audit(&self, group: &str) -> AutoscalerResult<GroupAudit> {
        let raws = self.store.list_values(&keys::audit_prefix(group)).await?;
        let mut events = Vec::with_capacity(raws.len());
        for raw in &raws {
            let stored: StoredAuditEvent =
                serde_json::from_str(raw).map_err(crate::storage::Error::from)?;
            events.push(stored);
        }
        events.sort_by_key(|stored| stored.event.timestamp_ms());

        let mut audit = GroupAudit::default();
        let mut per_instance: BTreeMap<String, InstanceAuditRecord> = BTreeMap::new();
        for stored in events {
            if stored.scope == GROUP_SCOPE {
                match stored.event {
                    AuditEvent::AutoscalerAction(e) => audit.autoscaler_action = Some(e),
                    AuditEvent::LauncherAction(e) => audit.launcher_action = Some(e),
                    AuditEvent::LastAutoscalerRun { timestamp_ms } => {
                        audit.last_autoscaler_run = Some(timestamp_ms)
                    }
                    AuditEvent::LastLauncherRun { timestamp_ms } => {
                        audit.last_launcher_run = Some(timestamp_ms)
                    }
                    _ => {}
                }
                continue;
            }
            let record = per_instance
                .entry(stored.scope.clone())
                .or_insert_with(|| InstanceAuditRecord {
                    instance_id: stored.scope.clone(),
                    ..Default::default()
                });
            match stored.event {
                AuditEvent::LatestStatus { state, .. } => record.latest_status = Some(state),
                AuditEvent::RequestToLaunch { timestamp_ms } => {
                    record.request_to_launch = Some(timestamp_ms)
                }
                AuditEvent::RequestToTerminate { timestamp_ms } => {
                    record.request_to_terminate = Some(timestamp_ms)
                }
                AuditEvent::ShutdownConfirmation { confirmed_at, .. } => {
                    record.shutdown_confirmation = Some(confirmed_at)
                }
                AuditEvent::Reconfigure { date, .. } => record.reconfigure = Some(date),
                AuditEvent::UnsetReconfigure { timestamp_ms } => {
                    record.unset_reconfigure = Some(timestamp_ms)
                }
                _ => {}
            }
        }
        audit.instances = per_instance.into_values().collect();
        Ok(audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupType;

    #[tokio::test]
    async fn test_fold_keeps_most_recent_of_each_kind() {
        let env = AutoscalerEnv::for_test();
        let audit = Audit::new(&env);

        audit.log_request_to_launch("g", "i-1").await.unwrap();
        audit.log_request_to_terminate("g", "i-1").await.unwrap();
        let state = InstanceState::provisioning("i-1".to_string(), GroupType::Bridge, "g");
        audit.log_latest_status("g", &state).await.unwrap();
        audit.log_request_to_launch("g", "i-2").await.unwrap();
        audit.update_last_launcher_run("g").await.unwrap();

        let generated = audit.generate_audit("g").await.unwrap();
        assert!(generated.last_launcher_run.is_some());
        assert!(generated.last_autoscaler_run.is_none());
        assert_eq!(generated.instances.len(), 2);

        let first = &generated.instances[0];
        assert_eq!(first.instance_id, "i-1");
        assert!(first.request_to_launch.is_some());
        assert!(first.request_to_terminate.is_some());
        assert_eq!(
            first.latest_status.as_ref().unwrap().instance_id,
            "i-1"
        );

        let second = &generated.instances[1];
        assert_eq!(second.instance_id, "i-2");
        assert!(second.request_to_launch.is_some());
        assert!(second.request_to_terminate.is_none());
    }

    #[tokio::test]
    async fn test_group_scope_actions() {
        let env = AutoscalerEnv::for_test();
        let audit = Audit::new(&env);

        audit
            .log_autoscaler_action(
                "g",
                AutoscalerActionEvent {
                    timestamp_ms: now_ms(),
                    action_type: AutoscalerActionType::IncreaseDesiredCount,
                    count: 1,
                    old_desired_count: 2,
                    new_desired_count: 3,
                    scale_metrics: vec![0.9, 0.9],
                },
            )
            .await
            .unwrap();

        let generated = audit.generate_audit("g").await.unwrap();
        let action = generated.autoscaler_action.unwrap();
        assert_eq!(action.action_type, AutoscalerActionType::IncreaseDesiredCount);
        assert_eq!(action.new_desired_count, 3);
        assert_eq!(action.scale_metrics, vec![0.9, 0.9]);
        assert!(generated.instances.is_empty());
    }

    #[tokio::test]
    async fn test_event_kind_strings() {
        let event = AuditEvent::LastAutoscalerRun { timestamp_ms: 1 };
        assert_eq!(event.kind(), "last-autoscaler-run");
        let raw = serde_json::to_string(&StoredAuditEvent {
            scope: "group".to_string(),
            event,
        })
        .unwrap();
        assert!(raw.contains("\"eventType\":\"last-autoscaler-run\""));
    }
}
