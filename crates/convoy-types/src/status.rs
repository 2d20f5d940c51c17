//! Payloads carried by worker responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot a worker reports in reply to `get-worker-status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Host id of the reporting worker.
    pub sender_id: String,
    /// Jobs currently executing on the worker.
    pub running_jobs: Vec<String>,
    pub free_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub uptime_secs: u64,
    pub reported_at: DateTime<Utc>,
}

/// Payload of `response-to-get-worker-id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerId {
    pub worker_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_status_camel_case() {
        let status = WorkerStatus {
            sender_id: "worker-1".into(),
            running_jobs: vec!["exec-9".into()],
            free_memory_bytes: 1024,
            total_memory_bytes: 4096,
            uptime_secs: 12,
            reported_at: Utc::now(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["senderId"], "worker-1");
        assert_eq!(value["runningJobs"][0], "exec-9");
        assert_eq!(value["freeMemoryBytes"], 1024);
        assert!(value.get("reportedAt").is_some());
    }
}
