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

//! Side-car endpoints. Ingestion problems never fail the response: the
//! side-car gets a no-op verdict and polls again.

use axum::{Extension, Json};
use serde::Serialize;

use super::ApiContextRef;
use crate::model::StatsReport;

/// What the side-car should do next.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarVerdict {
    pub shutdown: bool,
    pub reconfigure: bool,
}

async fn verdict_for(context: &ApiContextRef, instance_id: &str) -> SidecarVerdict {
    let shutdown = match context.shutdown_manager.get_shutdown_status(instance_id).await {
        Ok(shutdown) => shutdown,
        Err(e) => {
            tracing::warn!("failed to read shutdown marker of {}: {}", instance_id, e);
            false
        }
    };
    let reconfigure = match context
        .reconfigure_manager
        .get_reconfigure_date(instance_id)
        .await
    {
        Ok(date) => date.is_some(),
        Err(e) => {
            tracing::warn!("failed to read reconfigure marker of {}: {}", instance_id, e);
            false
        }
    };
    SidecarVerdict {
        shutdown,
        reconfigure,
    }
}

async fn ingest(context: &ApiContextRef, body: &str, quiet: bool) -> SidecarVerdict {
    let report: StatsReport = match serde_json::from_str(body) {
        Ok(report) => report,
        Err(e) => {
            if quiet {
                tracing::debug!("dropping unparseable side-car report: {}", e);
            } else {
                tracing::warn!("dropping unparseable side-car report: {}", e);
            }
            return SidecarVerdict::default();
        }
    };

    let instance_id = report.instance.instance_id.clone();
    let group = report
        .instance
        .metadata
        .group
        .clone()
        .unwrap_or_else(|| "default".to_string());

    if let Some(complete) = report.reconfigure_complete.clone() {
        if let Err(e) = context
            .reconfigure_manager
            .process_completion(&group, &instance_id, &complete)
            .await
        {
            tracing::warn!("reconfigure completion of {} failed: {}", instance_id, e);
        }
    }

    if let Err(e) = context.tracker.stats(report, false).await {
        if quiet {
            tracing::debug!("stats ingestion of {} failed: {}", instance_id, e);
        } else {
            tracing::warn!("stats ingestion of {} failed: {}", instance_id, e);
        }
    }

    verdict_for(context, &instance_id).await
}

pub async fn stats(
    Extension(context): Extension<ApiContextRef>,
    body: String,
) -> Json<SidecarVerdict> {
    Json(ingest(&context, &body, false).await)
}

/// Same as `/stats`, but ingestion errors stay out of the logs' warning
/// level; used by side-cars that only want the verdict refreshed.
pub async fn status(
    Extension(context): Extension<ApiContextRef>,
    body: String,
) -> Json<SidecarVerdict> {
    Json(ingest(&context, &body, true).await)
}

/// No stats: just the shutdown/reconfigure verdict.
pub async fn poll(
    Extension(context): Extension<ApiContextRef>,
    body: String,
) -> Json<SidecarVerdict> {
    let report: StatsReport = match serde_json::from_str(&body) {
        Ok(report) => report,
        Err(e) => {
            tracing::debug!("dropping unparseable poll body: {}", e);
            return Json(SidecarVerdict::default());
        }
    };
    Json(verdict_for(&context, &report.instance.instance_id).await)
}
