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

pub mod api;
pub mod audit;
pub mod cloud;
mod error;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod scaler;
mod server;
pub mod storage;
#[cfg(test)]
mod test_utils;

use std::future::Future;
use std::pin::Pin;

use clap::Parser;
pub use error::{AutoscalerError, AutoscalerResult};
use fleetscale_common::config::{load_config, StoreBackendKind};

#[derive(Debug, Clone, Parser)]
pub struct AutoscalerNodeOpts {
    /// Address the HTTP service binds to, overriding the config file.
    #[clap(long, env = "FS_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Store backend (`mem` or `redis`), overriding the config file.
    #[clap(long, env = "FS_BACKEND")]
    backend: Option<String>,

    /// Redis connection URL, overriding the config file.
    #[clap(long, env = "FS_REDIS_URL")]
    redis_url: Option<String>,

    /// Record launcher intent without touching the fleet.
    #[clap(long, env = "FS_DRY_RUN")]
    dry_run: bool,

    /// The path of the `fleetscale.toml` configuration file.
    ///
    /// If empty, default configuration values will be used.
    #[clap(long, env = "FS_CONFIG_PATH", default_value = "")]
    pub config_path: String,
}

/// Start the autoscaler node.
pub fn start(opts: AutoscalerNodeOpts) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tracing::info!("Starting autoscaler node with options {:?}", opts);
        let mut config = match load_config(&opts.config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("failed to load config: {:#}", e);
                std::process::exit(1);
            }
        };
        if let Some(listen_addr) = opts.listen_addr {
            config.server.listen_addr = listen_addr;
        }
        if let Some(backend) = opts.backend {
            config.store.backend = match backend.as_str() {
                "mem" => StoreBackendKind::Mem,
                "redis" => StoreBackendKind::Redis,
                other => {
                    tracing::error!("unknown store backend {}", other);
                    std::process::exit(1);
                }
            };
        }
        if let Some(redis_url) = opts.redis_url {
            config.store.redis_url = redis_url;
        }
        if opts.dry_run {
            config.launcher.dry_run = true;
        }
        tracing::info!("Starting autoscaler node with config {:?}", config);

        if let Err(e) = server::serve(config).await {
            tracing::error!("autoscaler exited with error: {:#}", e);
            std::process::exit(1);
        }
    })
}
