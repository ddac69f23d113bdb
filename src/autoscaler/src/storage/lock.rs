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

use std::sync::Arc;
use std::time::Duration;

use super::instance_store::{keys, InstanceStoreRef};
use super::{Error, Result};

pub type LockManagerRef = Arc<LockManager>;

/// Distributed mutexes over the instance store: one lock per group for all
/// per-group processing, one global lock for job production.
///
/// Acquisition failure surfaces as [`Error::LockUnavailable`] and means
/// "skip this cycle"; it is never retried within the same call. A crashed
/// holder's lock falls off by TTL.
pub struct LockManager {
    store: InstanceStoreRef,
    group_lock_ttl: Duration,
    job_creation_lock_ttl: Duration,
}

impl LockManager {
    pub fn new(
        store: InstanceStoreRef,
        group_lock_ttl: Duration,
        job_creation_lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            group_lock_ttl,
            job_creation_lock_ttl,
        }
    }

    pub async fn lock_group(&self, group: &str) -> Result<DistributedLock> {
        self.acquire(keys::group_lock(group), self.group_lock_ttl)
            .await
    }

    pub async fn lock_job_creation(&self) -> Result<DistributedLock> {
        self.acquire(
            keys::JOB_CREATION_LOCK.to_string(),
            self.job_creation_lock_ttl,
        )
        .await
    }

    async fn acquire(&self, key: String, ttl: Duration) -> Result<DistributedLock> {
        let owner = uuid::Uuid::new_v4().to_string();
        if self.store.try_acquire_lock(&key, &owner, ttl).await? {
            Ok(DistributedLock {
                store: self.store.clone(),
                key,
                owner,
            })
        } else {
            Err(Error::LockUnavailable(key))
        }
    }
}

/// A held lock. Must be released explicitly; a leaked lock expires by TTL.
pub struct DistributedLock {
    store: InstanceStoreRef,
    key: String,
    owner: String,
}

impl DistributedLock {
    pub async fn release(self) {
        if let Err(e) = self.store.release_lock(&self.key, &self.owner).await {
            tracing::warn!("failed to release lock {}: {}", self.key, e);
        }
    }
}
