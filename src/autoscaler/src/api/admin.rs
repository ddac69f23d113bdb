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

//! Admin endpoints. Unlike the side-car surface these fail closed:
//! validation problems are 400s, missing groups are 404s.

use std::time::Duration;

use axum::extract::Path;
use axum::{Extension, Json};
use serde::Deserialize;

use super::{ApiContextRef, Result};
use crate::audit::GroupAudit;
use crate::error::AutoscalerError;
use crate::model::{group_has_valid_desired_values, InstanceGroup};
use crate::monitor::GroupReport;

pub async fn list_groups(
    Extension(context): Extension<ApiContextRef>,
) -> Result<Json<Vec<InstanceGroup>>> {
    Ok(Json(context.group_manager.get_all_instance_groups().await?))
}

pub async fn get_group(
    Extension(context): Extension<ApiContextRef>,
    Path(name): Path<String>,
) -> Result<Json<InstanceGroup>> {
    Ok(Json(context.group_manager.require_instance_group(&name).await?))
}

pub async fn put_group(
    Extension(context): Extension<ApiContextRef>,
    Path(name): Path<String>,
    Json(group): Json<InstanceGroup>,
) -> Result<Json<InstanceGroup>> {
    if group.name != name {
        return Err(AutoscalerError::Validation(format!(
            "path name {} does not match body name {}",
            name, group.name
        ))
        .into());
    }
    context.group_manager.upsert_instance_group(group).await?;
    Ok(Json(context.group_manager.require_instance_group(&name).await?))
}

pub async fn delete_group(
    Extension(context): Extension<ApiContextRef>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    context.group_manager.require_instance_group(&name).await?;
    context.group_manager.delete_instance_group(&name).await?;
    Ok(Json(serde_json::json!({ "deleted": name })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredRequest {
    pub min_desired: Option<u32>,
    pub max_desired: Option<u32>,
    pub desired_count: Option<u32>,
}

pub async fn put_desired(
    Extension(context): Extension<ApiContextRef>,
    Path(name): Path<String>,
    Json(request): Json<DesiredRequest>,
) -> Result<Json<InstanceGroup>> {
    let lock = context.env.lock_manager().lock_group(&name).await.map_err(AutoscalerError::from)?;
    let result = put_desired_locked(&context, &name, request).await;
    lock.release().await;
    result
}

async fn put_desired_locked(
    context: &ApiContextRef,
    name: &str,
    request: DesiredRequest,
) -> Result<Json<InstanceGroup>> {
    let mut group = context.group_manager.require_instance_group(name).await?;
    let opts = &mut group.scaling_options;
    if let Some(min) = request.min_desired {
        opts.min_desired = min;
    }
    if let Some(max) = request.max_desired {
        opts.max_desired = max;
    }
    if let Some(desired) = request.desired_count {
        opts.desired_count = desired;
    }
    if !group_has_valid_desired_values(opts.min_desired, opts.max_desired, opts.desired_count) {
        return Err(AutoscalerError::Validation(format!(
            "desired values must satisfy min <= desired <= max, got {}/{}/{}",
            opts.min_desired, opts.desired_count, opts.max_desired
        ))
        .into());
    }
    context.group_manager.upsert_instance_group(group.clone()).await?;
    // A manual target change pauses the autoscaler like its own actions do.
    context.group_manager.set_auto_scale_grace_period(&group).await?;
    Ok(Json(
        context.group_manager.require_instance_group(name).await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingActivitiesRequest {
    pub enable_auto_scale: Option<bool>,
    pub enable_launch: Option<bool>,
}

pub async fn put_scaling_activities(
    Extension(context): Extension<ApiContextRef>,
    Path(name): Path<String>,
    Json(request): Json<ScalingActivitiesRequest>,
) -> Result<Json<InstanceGroup>> {
    let mut group = context.group_manager.require_instance_group(&name).await?;
    if let Some(enable) = request.enable_auto_scale {
        group.enable_auto_scale = enable;
    }
    if let Some(enable) = request.enable_launch {
        group.enable_launch = enable;
    }
    context.group_manager.upsert_instance_group(group).await?;
    Ok(Json(context.group_manager.require_instance_group(&name).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchProtectedRequest {
    pub count: u32,
    pub protected_ttl_sec: Option<u64>,
    pub instance_configuration_id: Option<String>,
}

/// Bump the desired count and shield the group (and the instances the
/// launcher will create for it) from scale-down.
pub async fn launch_protected(
    Extension(context): Extension<ApiContextRef>,
    Path(name): Path<String>,
    Json(request): Json<LaunchProtectedRequest>,
) -> Result<Json<InstanceGroup>> {
    let lock = context.env.lock_manager().lock_group(&name).await.map_err(AutoscalerError::from)?;
    let result = launch_protected_locked(&context, &name, request).await;
    lock.release().await;
    result
}

async fn launch_protected_locked(
    context: &ApiContextRef,
    name: &str,
    request: LaunchProtectedRequest,
) -> Result<Json<InstanceGroup>> {
    let mut group = context.group_manager.require_instance_group(name).await?;
    let new_desired = group.scaling_options.desired_count + request.count;
    if new_desired > group.scaling_options.max_desired {
        return Err(AutoscalerError::Validation(format!(
            "desired {} + {} exceeds max {}",
            group.scaling_options.desired_count, request.count, group.scaling_options.max_desired
        ))
        .into());
    }
    group.scaling_options.desired_count = new_desired;
    if let Some(ttl) = request.protected_ttl_sec {
        group.protected_ttl_sec = ttl;
    }
    if let Some(configuration_id) = request.instance_configuration_id {
        group.instance_configuration_id = configuration_id;
    }
    context.group_manager.upsert_instance_group(group.clone()).await?;
    context.group_manager.set_auto_scale_grace_period(&group).await?;
    context
        .group_manager
        .set_group_scale_down_protected(name, Duration::from_secs(group.protected_ttl_sec))
        .await?;
    Ok(Json(
        context.group_manager.require_instance_group(name).await?,
    ))
}

pub async fn reset_groups(
    Extension(context): Extension<ApiContextRef>,
) -> Result<Json<serde_json::Value>> {
    context
        .group_manager
        .reset_seed_groups(&context.seed_groups)
        .await?;
    Ok(Json(serde_json::json!({ "reset": context.seed_groups.len() })))
}

pub async fn get_report(
    Extension(context): Extension<ApiContextRef>,
    Path(name): Path<String>,
) -> Result<Json<GroupReport>> {
    Ok(Json(
        context.report_generator.generate_report(&name, None).await?,
    ))
}

pub async fn get_audit(
    Extension(context): Extension<ApiContextRef>,
    Path(name): Path<String>,
) -> Result<Json<GroupAudit>> {
    context.group_manager.require_instance_group(&name).await?;
    Ok(Json(context.audit.generate_audit(&name).await?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::GroupType;
    use crate::storage::keys;
    use crate::test_utils::{api_context, api_context_with_seed, test_group};

    #[tokio::test]
    async fn test_put_group_rejects_name_mismatch() {
        let context = Arc::new(api_context());
        let group = test_group("bridges", GroupType::Bridge);
        let result = put_group(
            Extension(context),
            Path("gateways".to_string()),
            Json(group),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_put_desired_validates_bounds() {
        let context = Arc::new(api_context());
        context
            .group_manager
            .upsert_instance_group(test_group("bridges", GroupType::Bridge))
            .await
            .unwrap();

        // desired > max is rejected and nothing changes.
        let result = put_desired(
            Extension(context.clone()),
            Path("bridges".to_string()),
            Json(DesiredRequest {
                min_desired: None,
                max_desired: None,
                desired_count: Some(50),
            }),
        )
        .await;
        assert!(result.is_err());
        let group = context
            .group_manager
            .require_instance_group("bridges")
            .await
            .unwrap();
        assert_eq!(group.scaling_options.desired_count, 2);

        // A valid subset update lands and arms the autoscale grace.
        let Json(updated) = put_desired(
            Extension(context.clone()),
            Path("bridges".to_string()),
            Json(DesiredRequest {
                min_desired: Some(2),
                max_desired: Some(6),
                desired_count: Some(4),
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.scaling_options.desired_count, 4);
        assert!(!context
            .group_manager
            .allow_autoscaling("bridges")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_launch_protected_bumps_and_protects() {
        let context = Arc::new(api_context());
        context
            .group_manager
            .upsert_instance_group(test_group("bridges", GroupType::Bridge))
            .await
            .unwrap();

        let Json(updated) = launch_protected(
            Extension(context.clone()),
            Path("bridges".to_string()),
            Json(LaunchProtectedRequest {
                count: 2,
                protected_ttl_sec: Some(120),
                instance_configuration_id: Some("config-9".to_string()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(updated.scaling_options.desired_count, 4);
        assert_eq!(updated.instance_configuration_id, "config-9");
        assert!(context
            .group_manager
            .is_scale_down_protected("bridges")
            .await
            .unwrap());
        assert!(!context
            .group_manager
            .allow_autoscaling("bridges")
            .await
            .unwrap());
        // The grace key was written with the group's TTL.
        assert!(context
            .env
            .store()
            .check_value(&keys::autoscale_grace("bridges"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_launch_protected_rejects_overflow() {
        let context = Arc::new(api_context());
        context
            .group_manager
            .upsert_instance_group(test_group("bridges", GroupType::Bridge))
            .await
            .unwrap();
        let result = launch_protected(
            Extension(context),
            Path("bridges".to_string()),
            Json(LaunchProtectedRequest {
                count: 10,
                protected_ttl_sec: None,
                instance_configuration_id: None,
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reset_preserves_desired_counts() {
        let mut seed = test_group("bridges", GroupType::Bridge);
        seed.scaling_options.desired_count = 2;
        let context = Arc::new(api_context_with_seed(vec![seed]));

        let mut live = test_group("bridges", GroupType::Bridge);
        live.scaling_options.desired_count = 5;
        context.group_manager.upsert_instance_group(live).await.unwrap();

        let _ = reset_groups(Extension(context.clone())).await.unwrap();
        let group = context
            .group_manager
            .require_instance_group("bridges")
            .await
            .unwrap();
        assert_eq!(group.scaling_options.desired_count, 5);
    }

    #[tokio::test]
    async fn test_get_group_missing_is_error() {
        let context = Arc::new(api_context());
        assert!(get_group(Extension(context), Path("nope".to_string()))
            .await
            .is_err());
    }
}
