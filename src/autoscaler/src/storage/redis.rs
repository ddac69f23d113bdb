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

//! Durable store shared by all control-plane replicas.
//!
//! Layout: one string key per group definition, one hash per group for
//! instance states, one sorted set per group for metric points (score =
//! sample timestamp, trimmed on read), TTL'd string keys for every marker,
//! `SET NX PX` keys for locks. Bulk listings go through `SCAN`/`HSCAN`
//! cursors so no single round-trip grows with fleet size.

use std::time::Duration;

use async_trait::async_trait;
use fleetscale_common::util::time::now_ms;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, AsyncIter};

use super::instance_store::{keys, InstanceStore};
use super::Result;
use crate::model::{InstanceGroup, InstanceId, InstanceMetric, InstanceState};

/// Owner-checked lock release; deleting unconditionally could drop a lock
/// that has already expired and been re-acquired by another replica.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("connected to redis at {}", url);
        Ok(Self { conn })
    }

    /// Shared connection handle for the job queues living in the same
    /// Redis.
    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut found = Vec::new();
        {
            let mut iter: AsyncIter<'_, String> = conn.scan_match(pattern).await?;
            while let Some(key) = iter.next_item().await {
                found.push(key);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl InstanceStore for RedisStore {
    async fn get_instance_group(&self, name: &str) -> Result<Option<InstanceGroup>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::group(name)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn upsert_instance_group(&self, group: &InstanceGroup) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(group)?;
        let _: () = conn.set(keys::group(&group.name), raw).await?;
        Ok(())
    }

    async fn delete_instance_group(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::group(name)).await?;
        Ok(())
    }

    async fn get_all_instance_groups(&self) -> Result<Vec<InstanceGroup>> {
        let mut conn = self.conn.clone();
        let mut groups = Vec::new();
        for key in self.scan_keys(&format!("{}*", keys::GROUP_PREFIX)).await? {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(raw) = raw {
                groups.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(groups)
    }

    async fn exists_at_least_one_group(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut iter: AsyncIter<'_, String> =
            conn.scan_match(format!("{}*", keys::GROUP_PREFIX)).await?;
        Ok(iter.next_item().await.is_some())
    }

    async fn fetch_instance_states(&self, group: &str) -> Result<Vec<InstanceState>> {
        let mut conn = self.conn.clone();
        let mut states = Vec::new();
        {
            let mut iter: AsyncIter<'_, (String, String)> =
                conn.hscan(keys::instance_status_hash(group)).await?;
            while let Some((_, raw)) = iter.next_item().await {
                states.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(states)
    }

    async fn save_instance_status(&self, group: &str, state: &InstanceState) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(state)?;
        let _: () = conn
            .hset(keys::instance_status_hash(group), &state.instance_id, raw)
            .await?;
        Ok(())
    }

    async fn delete_instance_states(&self, group: &str, ids: &[InstanceId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(keys::instance_status_hash(group), ids).await?;
        Ok(())
    }

    async fn write_instance_metric(
        &self,
        group: &str,
        metric: &InstanceMetric,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = keys::metric_set(group);
        let raw = serde_json::to_string(metric)?;
        let _: () = conn.zadd(&key, raw, metric.timestamp_ms).await?;
        // Refresh the series TTL so an abandoned group's metrics eventually
        // disappear wholesale.
        let _: () = conn.expire(&key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn get_instance_metrics(
        &self,
        group: &str,
        retention: Duration,
    ) -> Result<Vec<InstanceMetric>> {
        let mut conn = self.conn.clone();
        let key = keys::metric_set(group);
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let _: () = conn.zrembyscore(&key, 0, cutoff).await?;
        let raws: Vec<String> = conn.zrangebyscore(&key, cutoff, "+inf").await?;
        raws.iter()
            .map(|raw| serde_json::from_str(raw).map_err(Into::into))
            .collect()
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn check_value(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn list_values(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut values = Vec::new();
        for key in self.scan_keys(&format!("{}*", prefix)).await? {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(raw) = raw {
                values.push(raw);
            }
        }
        Ok(values)
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i32 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
