//! Scheduler configuration

use crate::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};

/// Configuration for a [`super::Scheduler`]
///
/// Missing fields take their defaults when deserialized, so an embedding
/// application can keep only the keys it cares about in its config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Maximum number of jobs running at once (must be at least 1)
    pub max_concurrent_jobs: usize,

    /// Label attached to the scheduler's log events
    pub name: Option<String>,
}

impl SchedulerOptions {
    /// Options with an explicit concurrency limit
    pub fn with_limit(max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs,
            ..Self::default()
        }
    }

    /// Restrict to one job at a time
    pub fn serial() -> Self {
        Self::with_limit(1)
    }

    /// Check the options before use
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(SyncError::InvalidLimit(self.max_concurrent_jobs));
        }
        Ok(())
    }
}

impl Default for SchedulerOptions {
    /// One job slot per CPU core
    fn default() -> Self {
        Self {
            max_concurrent_jobs: num_cpus::get(),
            name: None,
        }
    }
}
