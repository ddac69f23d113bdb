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

//! Control-plane assembly: store backend selection, component wiring,
//! loop spawning and the HTTP listener.

use std::fs;
use std::sync::Arc;

use anyhow::Context;
use fleetscale_common::config::{FleetscaleConfig, StoreBackendKind};
use tokio::net::TcpListener;

use crate::api::{self, ApiContext};
use crate::audit::Audit;
use crate::cloud::{CloudManager, SimulatedCloudManager};
use crate::job::{JobManager, JobQueues};
use crate::manager::{
    AutoscalerEnv, AutoscalerOpts, InstanceGroupManager, InstanceTracker, ReconfigureManager,
    ShutdownManager,
};
use crate::model::InstanceGroup;
use crate::monitor::{GroupReportGenerator, MetricsLoop, SanityLoop};
use crate::scaler::{AutoscaleProcessor, InstanceLauncher};
use crate::storage::{InstanceStoreRef, MemStore, RedisStore};

fn load_seed_groups(config: &FleetscaleConfig) -> anyhow::Result<Vec<InstanceGroup>> {
    let Some(path) = &config.groups.seed_file else {
        return Ok(Vec::new());
    };
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path))
}

fn build_cloud_manager(config: &FleetscaleConfig) -> CloudManager {
    let mut manager = CloudManager::new();
    for provider in &config.cloud.providers {
        match provider.as_str() {
            "sim" => {
                manager = manager.with_adapter("sim", Arc::new(SimulatedCloudManager::new()));
            }
            other => {
                tracing::warn!("unknown cloud provider {} in config, skipping", other);
            }
        }
    }
    manager
}

/// Run the control plane until ctrl-c.
pub async fn serve(config: FleetscaleConfig) -> anyhow::Result<()> {
    let opts = AutoscalerOpts::from_config(&config);
    let seed_groups = load_seed_groups(&config)?;

    let (store, queues): (InstanceStoreRef, JobQueues) = match config.store.backend {
        StoreBackendKind::Mem => {
            tracing::info!("using in-memory store");
            (Arc::new(MemStore::new()), JobQueues::in_memory())
        }
        StoreBackendKind::Redis => {
            let store = RedisStore::connect(&config.store.redis_url).await?;
            let queues = JobQueues::redis(&store);
            (Arc::new(store) as InstanceStoreRef, queues)
        }
    };

    let env = AutoscalerEnv::new(store, opts);
    let audit = Arc::new(Audit::new(&env));
    let shutdown_manager = Arc::new(ShutdownManager::new(env.clone(), audit.clone()));
    let reconfigure_manager = Arc::new(ReconfigureManager::new(env.clone(), audit.clone()));
    let tracker = Arc::new(InstanceTracker::new(
        env.clone(),
        shutdown_manager.clone(),
        audit.clone(),
    ));
    let group_manager = Arc::new(InstanceGroupManager::new(env.clone()));
    let cloud_manager = Arc::new(build_cloud_manager(&config));
    let processor = Arc::new(AutoscaleProcessor::new(
        env.clone(),
        tracker.clone(),
        group_manager.clone(),
        audit.clone(),
    ));
    let launcher = Arc::new(InstanceLauncher::new(
        env.clone(),
        tracker.clone(),
        group_manager.clone(),
        shutdown_manager.clone(),
        audit.clone(),
        cloud_manager.clone(),
    ));
    let sanity = Arc::new(SanityLoop::new(
        env.clone(),
        tracker.clone(),
        group_manager.clone(),
        cloud_manager.clone(),
    ));
    let report_generator = Arc::new(GroupReportGenerator::new(
        env.clone(),
        tracker.clone(),
        group_manager.clone(),
        shutdown_manager.clone(),
        reconfigure_manager.clone(),
        cloud_manager.clone(),
    ));

    group_manager.apply_seed_groups(&seed_groups).await?;

    let job_manager = Arc::new(JobManager::new(
        env.clone(),
        group_manager.clone(),
        queues,
        processor,
        launcher,
        sanity,
    ));
    let (producer_handle, producer_shutdown) = job_manager.start_producer();
    let consumer_handles = job_manager.start_consumers();
    let metrics_loop = Arc::new(MetricsLoop::new(
        env.clone(),
        tracker.clone(),
        group_manager.clone(),
    ));
    let (metrics_handle, metrics_shutdown) = metrics_loop.start();

    let context = Arc::new(ApiContext {
        env: env.clone(),
        tracker,
        group_manager,
        shutdown_manager,
        reconfigure_manager,
        audit,
        report_generator,
        seed_groups: Arc::new(seed_groups),
    });
    let router = api::router(context, env.metrics().registry());

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    tracing::info!("autoscaler listening at {}", config.server.listen_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("shutting down background loops");
    let _ = producer_shutdown.send(());
    let _ = metrics_shutdown.send(());
    producer_handle.await?;
    metrics_handle.await?;
    for (handle, shutdown) in consumer_handles {
        let _ = shutdown.send(());
        handle.await?;
    }
    tracing::info!("autoscaler stopped");
    Ok(())
}
