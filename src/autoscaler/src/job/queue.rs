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

//! The three logical job queues. The in-process profile serves a single
//! replica; the Redis profile is a shared list consumed by every replica.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::storage::{keys, RedisStore, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Autoscaler,
    Launcher,
    Sanity,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Autoscaler => "autoscaler",
            JobKind::Launcher => "launcher",
            JobKind::Sanity => "sanity",
        }
    }

    pub fn all() -> [JobKind; 3] {
        [JobKind::Autoscaler, JobKind::Launcher, JobKind::Sanity]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub kind: JobKind,
    pub group_name: String,
}

pub type JobQueueRef = Arc<dyn JobQueue>;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: Job) -> Result<()>;

    /// Non-blocking pop; consumers poll on their own cadence.
    async fn pop(&self) -> Result<Option<Job>>;

    async fn len(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct MemJobQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl MemJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemJobQueue {
    async fn push(&self, job: Job) -> Result<()> {
        self.jobs.lock().push_back(job);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Job>> {
        Ok(self.jobs.lock().pop_front())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.jobs.lock().len())
    }
}

pub struct RedisJobQueue {
    conn: ConnectionManager,
    key: String,
}

impl RedisJobQueue {
    pub fn new(store: &RedisStore, kind: JobKind) -> Self {
        Self {
            conn: store.connection(),
            key: keys::job_queue(kind.as_str()),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, job: Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(&job)?;
        let _: () = conn.lpush(&self.key, raw).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.rpop(&self.key, None).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.key).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_queue_fifo() {
        let queue = MemJobQueue::new();
        for group in ["a", "b"] {
            queue
                .push(Job {
                    kind: JobKind::Autoscaler,
                    group_name: group.to_string(),
                })
                .await
                .unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(queue.pop().await.unwrap().unwrap().group_name, "a");
        assert_eq!(queue.pop().await.unwrap().unwrap().group_name, "b");
        assert!(queue.pop().await.unwrap().is_none());
    }

    #[test]
    fn test_job_wire_format() {
        let job = Job {
            kind: JobKind::Sanity,
            group_name: "bridges".to_string(),
        };
        let raw = serde_json::to_string(&job).unwrap();
        assert_eq!(raw, r#"{"kind":"sanity","groupName":"bridges"}"#);
        let parsed: Job = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, job);
    }
}
