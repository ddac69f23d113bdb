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

use thiserror::Error;

use crate::storage;

pub type AutoscalerResult<T> = std::result::Result<T, AutoscalerError>;

#[derive(Error, Debug)]
pub enum AutoscalerError {
    /// Requested group or instance is missing. 404 at the API edge, fatal
    /// inside a job.
    #[error("instance group {0} not found")]
    GroupNotFound(String),

    /// Invalid desired-count combination or name mismatch. 400 at the API
    /// edge.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Transient: another replica holds the lock. The job returns `false`
    /// and the next interval retries.
    #[error("lock {0} unavailable")]
    LockUnavailable(String),

    /// Cloud adapter failure, after the adapter's own retries. A partial
    /// scale-up is reported as this kind too.
    #[error("cloud operation failed: {0}")]
    Cloud(String),

    /// The untracked-instance count exceeds the launch throttle threshold.
    /// Same disposition as [`AutoscalerError::Cloud`], distinct for
    /// observability.
    #[error("scale-up throttled: {0}")]
    Throttled(String),

    #[error("store error: {0}")]
    Store(#[source] storage::Error),
}

impl From<storage::Error> for AutoscalerError {
    fn from(e: storage::Error) -> Self {
        match e {
            storage::Error::LockUnavailable(key) => AutoscalerError::LockUnavailable(key),
            other => AutoscalerError::Store(other),
        }
    }
}
