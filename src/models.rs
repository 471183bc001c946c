use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One assignable replica of a job. A job emits `num_workers` of these at
/// creation; the fault detector re-enqueues fresh ones when a worker stalls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
  pub customer_id: String,
  pub task_id: String,
}

#[derive(Debug, Clone)]
pub struct OutputFile {
  pub name: String,
  pub data: Vec<u8>,
}

/// Aggregate state of one client submission, keyed by customer id.
#[derive(Debug)]
pub struct Job {
  pub customer_id: String,
  pub task_id: String,
  pub customer_name: String,
  pub code: Vec<u8>,
  pub requirement: Option<Vec<u8>>,
  pub dataset_shards: Vec<Vec<u8>>,
  pub num_workers: usize,
  pub assigned_workers: Vec<String>,
  pub heartbeats: HashMap<String, DateTime<Utc>>,
  pub results: HashMap<String, Vec<u8>>,
  pub usage: HashMap<String, Vec<u8>>,
  pub output_files: HashMap<String, Vec<OutputFile>>,
  pub pending_workers: usize,
  pub is_completed: bool,
  pub is_cancelled: bool,
  pub completion_notified: bool,
  pub created_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
  pub fn submitted(&self) -> usize {
    self.results.len()
  }

  pub fn progress(&self) -> ProgressSnapshot {
    let submitted = self.submitted();
    ProgressSnapshot {
      submitted,
      total: self.num_workers,
      percentage: (submitted * 100 / self.num_workers.max(1)) as u8,
    }
  }

  pub fn status_view(&self) -> StatusView {
    let progress = self.progress();
    StatusView {
      submitted: progress.submitted,
      total: progress.total,
      percentage: progress.percentage,
      is_completed: self.is_completed,
      is_cancelled: self.is_cancelled,
      can_download: self.is_completed && !self.is_cancelled,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
  Progress,
  Completed,
  Cancelled,
}

impl std::fmt::Display for UpdateStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      UpdateStatus::Progress => write!(f, "progress"),
      UpdateStatus::Completed => write!(f, "completed"),
      UpdateStatus::Cancelled => write!(f, "cancelled"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
  pub submitted: usize,
  pub total: usize,
  pub percentage: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
  #[serde(rename = "customerId")]
  pub customer_id: String,
  pub text: String,
  pub timestamp: DateTime<Utc>,
  pub status: UpdateStatus,
  #[serde(rename = "isCompletion")]
  pub is_completion: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub progress: Option<ProgressSnapshot>,
}

/// Handed back to the client on submission.
#[derive(Debug, Clone, Serialize)]
pub struct JobTicket {
  #[serde(rename = "customerId")]
  pub customer_id: String,
  #[serde(rename = "taskId")]
  pub task_id: String,
  #[serde(rename = "numWorkers")]
  pub num_workers: usize,
}

#[derive(Debug)]
pub struct Assignment {
  pub task_id: String,
  pub customer_id: String,
  pub worker_index: usize,
  pub total_workers: usize,
  pub code: Vec<u8>,
  pub dataset: Vec<u8>,
  pub requirement: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum ClaimOutcome {
  NoWork,
  Cancelled { customer_id: String },
  Assigned(Box<Assignment>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  Accepted {
    submitted: usize,
    total: usize,
    pending_workers: usize,
    completed: bool,
  },
  UnknownJob,
  Cancelled,
  Unauthorized,
  Duplicate,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusView {
  pub submitted: usize,
  pub total: usize,
  pub percentage: u8,
  #[serde(rename = "isCompleted")]
  pub is_completed: bool,
  #[serde(rename = "isCancelled")]
  pub is_cancelled: bool,
  #[serde(rename = "canDownload")]
  pub can_download: bool,
}

/// Point-in-time ownership view of a job, served to operators and used by
/// the integration tests to check invariants.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
  #[serde(rename = "customerId")]
  pub customer_id: String,
  #[serde(rename = "taskId")]
  pub task_id: String,
  #[serde(rename = "numWorkers")]
  pub num_workers: usize,
  #[serde(rename = "assignedWorkers")]
  pub assigned_workers: Vec<String>,
  #[serde(rename = "heartbeatWorkers")]
  pub heartbeat_workers: Vec<String>,
  #[serde(rename = "submittedWorkers")]
  pub submitted_workers: Vec<String>,
  #[serde(rename = "pendingWorkers")]
  pub pending_workers: usize,
  #[serde(rename = "isCompleted")]
  pub is_completed: bool,
  #[serde(rename = "isCancelled")]
  pub is_cancelled: bool,
}

/// Stall detected by the sweep; consumed by the detector loop for logging
/// and audit counters.
#[derive(Debug, Clone)]
pub struct StallEvent {
  pub customer_id: String,
  pub task_id: String,
  pub worker_id: String,
}
