//! Worker status snapshots for `get-worker-status`.

use std::time::Instant;

use chrono::Utc;
use convoy_types::WorkerStatus;
use sysinfo::System;

/// Collects host metrics for status replies.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    host_id: String,
    started: Instant,
}

impl StatusReporter {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            started: Instant::now(),
        }
    }

    /// Take a fresh snapshot. Memory figures are in bytes.
    pub fn snapshot(&self, running_jobs: Vec<String>) -> WorkerStatus {
        let mut system = System::new();
        system.refresh_memory();

        WorkerStatus {
            sender_id: self.host_id.clone(),
            running_jobs,
            free_memory_bytes: system.available_memory(),
            total_memory_bytes: system.total_memory(),
            uptime_secs: self.started.elapsed().as_secs(),
            reported_at: Utc::now(),
        }
    }
}
