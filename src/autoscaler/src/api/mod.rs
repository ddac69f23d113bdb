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

//! HTTP surface: the side-car report endpoints, the admin group API and
//! Prometheus exposition, all on one listener.

mod admin;
mod sidecar;

use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;

use crate::audit::AuditRef;
use crate::error::AutoscalerError;
use crate::manager::{
    AutoscalerEnv, InstanceGroupManagerRef, InstanceTrackerRef, ReconfigureManagerRef,
    ShutdownManagerRef,
};
use crate::model::InstanceGroup;
use crate::monitor::GroupReportGeneratorRef;

/// Everything the handlers need, shared via an axum extension.
#[derive(Clone)]
pub struct ApiContext {
    pub env: AutoscalerEnv,
    pub tracker: InstanceTrackerRef,
    pub group_manager: InstanceGroupManagerRef,
    pub shutdown_manager: ShutdownManagerRef,
    pub reconfigure_manager: ReconfigureManagerRef,
    pub audit: AuditRef,
    pub report_generator: GroupReportGeneratorRef,
    pub seed_groups: Arc<Vec<InstanceGroup>>,
}

pub type ApiContextRef = Arc<ApiContext>;

#[derive(Debug)]
pub struct ApiError(AutoscalerError);

pub type Result<T> = std::result::Result<T, ApiError>;

impl From<AutoscalerError> for ApiError {
    fn from(e: AutoscalerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AutoscalerError::GroupNotFound(_) => StatusCode::NOT_FOUND,
            AutoscalerError::Validation(_) => StatusCode::BAD_REQUEST,
            AutoscalerError::LockUnavailable(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut resp = Json(json!({ "error": format!("{}", self.0) })).into_response();
        *resp.status_mut() = status;
        resp
    }
}

pub fn router(context: ApiContextRef, registry: Registry) -> Router {
    Router::new()
        .route("/stats", post(sidecar::stats))
        .route("/status", post(sidecar::status))
        .route("/poll", post(sidecar::poll))
        .route("/groups", get(admin::list_groups))
        .route("/groups/reset", post(admin::reset_groups))
        .route(
            "/groups/:name",
            get(admin::get_group)
                .put(admin::put_group)
                .delete(admin::delete_group),
        )
        .route("/groups/:name/desired", put(admin::put_desired))
        .route(
            "/groups/:name/scaling-activities",
            put(admin::put_scaling_activities),
        )
        .route(
            "/groups/:name/actions/launch-protected",
            post(admin::launch_protected),
        )
        .route("/groups/:name/report", get(admin::get_report))
        .route("/groups/:name/audit", get(admin::get_audit))
        .route("/metrics", get(metrics_service))
        .layer(Extension(context))
        .layer(Extension(registry))
}

async fn metrics_service(Extension(registry): Extension<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    let mf = registry.gather();
    encoder.encode(&mf, &mut buffer).unwrap();

    Response::builder()
        .header(axum::http::header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .unwrap()
}
