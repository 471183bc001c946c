use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::feed::ProgressFeed;
use crate::models::{
  Assignment, ClaimOutcome, Job, JobTicket, JobView, OutputFile, ProgressSnapshot,
  ProgressUpdate, StallEvent, StatusView, SubmitOutcome, UpdateStatus, WorkUnit,
};
use crate::queue::TaskQueue;

pub struct NewJob {
  pub customer_name: String,
  pub code: Vec<u8>,
  pub dataset: Option<Vec<u8>>,
  pub requirement: Option<Vec<u8>>,
  pub num_workers: usize,
}

pub struct UpdatesView {
  pub updates: Vec<ProgressUpdate>,
  pub progress: Option<ProgressSnapshot>,
  pub is_completed: bool,
}

/// Everything a result download needs, cloned out under the lock so the
/// ZIP is built without holding it.
pub struct DownloadSnapshot {
  pub customer_id: String,
  pub task_id: String,
  pub customer_name: String,
  pub num_workers: usize,
  pub created_at: chrono::DateTime<chrono::Utc>,
  pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
  pub results: Vec<(String, Vec<u8>)>,
  pub usage: Vec<(String, Vec<u8>)>,
  pub outputs: Vec<(String, Vec<OutputFile>)>,
}

struct EngineState {
  jobs: HashMap<String, Job>,
  queue: TaskQueue,
  feed: ProgressFeed,
}

/// The job lifecycle engine. Owns the jobs map, the work-unit queue and
/// the progress feed behind a single mutex; every public operation locks,
/// performs its transition and releases before any network or archive
/// work. Handed explicitly to all route handlers and to the fault
/// detector.
pub struct Engine {
  state: Mutex<EngineState>,
  clock: Arc<dyn Clock>,
  heartbeat_timeout: Duration,
}

impl Engine {
  pub fn new(clock: Arc<dyn Clock>, heartbeat_timeout_ms: u64) -> Self {
    Self {
      state: Mutex::new(EngineState {
        jobs: HashMap::new(),
        queue: TaskQueue::new(),
        feed: ProgressFeed::new(),
      }),
      clock,
      heartbeat_timeout: Duration::milliseconds(heartbeat_timeout_ms as i64),
    }
  }

  pub async fn create_job(&self, new_job: NewJob) -> Result<JobTicket, EngineError> {
    if new_job.code.is_empty() {
      return Err(EngineError::Validation("code file is required".into()));
    }
    if new_job.num_workers == 0 {
      return Err(EngineError::Validation("worker count must be at least 1".into()));
    }

    let now = self.clock.now();
    let task_id = Uuid::new_v4().to_string();
    let shards = split_dataset(new_job.dataset.as_deref().unwrap_or(&[]), new_job.num_workers);

    let mut state = self.state.lock().await;
    let customer_id = unique_customer_id(&state.jobs, now.timestamp_micros());

    let job = Job {
      customer_id: customer_id.clone(),
      task_id: task_id.clone(),
      customer_name: new_job.customer_name,
      code: new_job.code,
      requirement: new_job.requirement,
      dataset_shards: shards,
      num_workers: new_job.num_workers,
      assigned_workers: Vec::new(),
      heartbeats: HashMap::new(),
      results: HashMap::new(),
      usage: HashMap::new(),
      output_files: HashMap::new(),
      pending_workers: new_job.num_workers,
      is_completed: false,
      is_cancelled: false,
      completion_notified: false,
      created_at: now,
      completed_at: None,
    };

    for _ in 0..job.num_workers {
      state.queue.enqueue(WorkUnit {
        customer_id: customer_id.clone(),
        task_id: task_id.clone(),
      });
    }
    state.feed.push(ProgressUpdate {
      customer_id: customer_id.clone(),
      text: format!("task queued for {} workers", job.num_workers),
      timestamp: now,
      status: UpdateStatus::Progress,
      is_completion: false,
      progress: Some(job.progress()),
    });
    let num_workers = job.num_workers;
    state.jobs.insert(customer_id.clone(), job);

    info!(%customer_id, %task_id, num_workers, "job created");
    Ok(JobTicket { customer_id, task_id, num_workers })
  }

  /// Hand the next queued unit to `worker_id`. A single unit is popped; a
  /// unit whose job vanished or whose slots are already full is consumed
  /// without assignment and the caller simply polls again.
  pub async fn claim(&self, worker_id: &str) -> ClaimOutcome {
    let now = self.clock.now();
    let mut state = self.state.lock().await;
    let EngineState { jobs, queue, feed } = &mut *state;

    let Some(unit) = queue.claim() else {
      return ClaimOutcome::NoWork;
    };
    let Some(job) = jobs.get_mut(&unit.customer_id) else {
      info!(customer_id = %unit.customer_id, "dropping unit for vanished job");
      return ClaimOutcome::NoWork;
    };
    if job.is_cancelled {
      return ClaimOutcome::Cancelled { customer_id: job.customer_id.clone() };
    }
    let index = job.assigned_workers.len();
    if index >= job.num_workers {
      // Stale re-enqueue racing a completed rescue.
      info!(customer_id = %job.customer_id, "dropping stale unit, all slots assigned");
      return ClaimOutcome::NoWork;
    }

    job.assigned_workers.push(worker_id.to_string());
    job.heartbeats.insert(worker_id.to_string(), now);

    let progress = job.progress();
    feed.push(ProgressUpdate {
      customer_id: job.customer_id.clone(),
      text: format!("worker {} assigned, {}/{} submitted", worker_id, progress.submitted, progress.total),
      timestamp: now,
      status: UpdateStatus::Progress,
      is_completion: false,
      progress: Some(progress),
    });

    info!(customer_id = %job.customer_id, worker_id, worker_index = index, "work unit assigned");
    ClaimOutcome::Assigned(Box::new(Assignment {
      task_id: job.task_id.clone(),
      customer_id: job.customer_id.clone(),
      worker_index: index,
      total_workers: job.num_workers,
      code: job.code.clone(),
      dataset: job.dataset_shards[index].clone(),
      requirement: job.requirement.clone(),
    }))
  }

  /// Accept one worker's result, at most once per worker per job.
  pub async fn submit(
    &self,
    worker_id: &str,
    customer_id: &str,
    result: Vec<u8>,
    usage: Vec<u8>,
    outputs: Vec<OutputFile>,
  ) -> SubmitOutcome {
    let now = self.clock.now();
    let mut state = self.state.lock().await;
    let EngineState { jobs, feed, .. } = &mut *state;

    let Some(job) = jobs.get_mut(customer_id) else {
      return SubmitOutcome::UnknownJob;
    };
    if job.is_cancelled {
      return SubmitOutcome::Cancelled;
    }
    if !job.assigned_workers.iter().any(|w| w == worker_id) {
      return SubmitOutcome::Unauthorized;
    }
    if job.results.contains_key(worker_id) {
      return SubmitOutcome::Duplicate;
    }

    job.results.insert(worker_id.to_string(), result);
    job.usage.insert(worker_id.to_string(), usage);
    job.output_files.insert(worker_id.to_string(), outputs);
    job.heartbeats.remove(worker_id);
    job.pending_workers = job.pending_workers.saturating_sub(1);

    let progress = job.progress();
    feed.push(ProgressUpdate {
      customer_id: job.customer_id.clone(),
      text: format!("worker {} submitted, {}/{} done", worker_id, progress.submitted, progress.total),
      timestamp: now,
      status: UpdateStatus::Progress,
      is_completion: false,
      progress: Some(progress),
    });

    let completed =
      job.results.len() == job.num_workers && job.assigned_workers.len() == job.num_workers;
    if completed {
      job.is_completed = true;
      job.completed_at = Some(now);
      if !job.completion_notified {
        job.completion_notified = true;
        feed.push(ProgressUpdate {
          customer_id: job.customer_id.clone(),
          text: format!("all {} workers finished, results ready", job.num_workers),
          timestamp: now,
          status: UpdateStatus::Completed,
          is_completion: true,
          progress: Some(progress),
        });
      }
      info!(customer_id, "job completed");
    }

    info!(customer_id, worker_id, submitted = progress.submitted, "result accepted");
    SubmitOutcome::Accepted {
      submitted: progress.submitted,
      total: progress.total,
      pending_workers: job.pending_workers,
      completed,
    }
  }

  /// Refresh a worker's heartbeat. Returns false when the job is gone,
  /// cancelled, or the worker holds no slot; a worker that already
  /// submitted keeps getting true without any state change.
  pub async fn heartbeat(&self, worker_id: &str, customer_id: &str) -> bool {
    let now = self.clock.now();
    let mut state = self.state.lock().await;
    let Some(job) = state.jobs.get_mut(customer_id) else {
      return false;
    };
    if job.is_cancelled || !job.assigned_workers.iter().any(|w| w == worker_id) {
      return false;
    }
    if let Some(beat) = job.heartbeats.get_mut(worker_id) {
      *beat = now;
    }
    true
  }

  pub async fn cancel(&self, customer_id: &str) -> Result<(), EngineError> {
    let now = self.clock.now();
    let mut state = self.state.lock().await;
    let EngineState { jobs, queue, feed } = &mut *state;

    let Some(job) = jobs.get_mut(customer_id) else {
      return Err(EngineError::UnknownJob(customer_id.to_string()));
    };
    if job.is_completed {
      // Completed and cancelled are mutually exclusive; a finished job
      // stays finished.
      warn!(customer_id, "cancel ignored, job already completed");
      return Ok(());
    }
    if job.is_cancelled {
      return Ok(());
    }

    let dropped = queue.drop_customer(customer_id);
    job.is_cancelled = true;
    job.pending_workers = 0;
    job.heartbeats.clear();

    feed.push(ProgressUpdate {
      customer_id: customer_id.to_string(),
      text: "task cancelled by client".into(),
      timestamp: now,
      status: UpdateStatus::Cancelled,
      is_completion: false,
      progress: Some(job.progress()),
    });
    info!(customer_id, dropped_units = dropped, "job cancelled");
    Ok(())
  }

  pub async fn is_cancel_requested(&self, customer_id: &str) -> bool {
    let state = self.state.lock().await;
    state.jobs.get(customer_id).map(|j| j.is_cancelled).unwrap_or(false)
  }

  pub async fn status(&self, customer_id: &str) -> Result<StatusView, EngineError> {
    let state = self.state.lock().await;
    state
      .jobs
      .get(customer_id)
      .map(|j| j.status_view())
      .ok_or_else(|| EngineError::UnknownJob(customer_id.to_string()))
  }

  pub async fn drain_updates(&self, customer_id: &str) -> Result<UpdatesView, EngineError> {
    let now = self.clock.now();
    let mut state = self.state.lock().await;
    let EngineState { jobs, feed, .. } = &mut *state;
    let Some(job) = jobs.get(customer_id) else {
      return Err(EngineError::UnknownJob(customer_id.to_string()));
    };
    Ok(UpdatesView {
      updates: feed.drain(customer_id, now),
      progress: Some(job.progress()),
      is_completed: job.is_completed,
    })
  }

  /// Remove the job outright, with its feed buffer and cancellation flag.
  /// Queued units are left behind and consumed lazily: a claim that pops a
  /// unit for a vanished job drops it and reports no work.
  pub async fn delete_job(&self, customer_id: &str) -> bool {
    let mut state = self.state.lock().await;
    let existed = state.jobs.remove(customer_id).is_some();
    state.feed.clear(customer_id);
    if existed {
      info!(customer_id, "job deleted");
    }
    existed
  }

  /// One fault-detector pass: evict every assigned worker whose heartbeat
  /// is older than the stall threshold and put a replacement unit at the
  /// queue tail. `pending_workers` is left alone, the outstanding slot is
  /// still outstanding.
  pub async fn sweep_stale(&self) -> Vec<StallEvent> {
    let now = self.clock.now();
    let mut state = self.state.lock().await;
    let EngineState { jobs, queue, feed } = &mut *state;

    let mut events = Vec::new();
    for job in jobs.values_mut() {
      if job.is_completed || job.is_cancelled {
        continue;
      }
      let stale: Vec<String> = job
        .heartbeats
        .iter()
        .filter(|(_, beat)| now - **beat > self.heartbeat_timeout)
        .map(|(worker, _)| worker.clone())
        .collect();

      for worker_id in stale {
        job.assigned_workers.retain(|w| w != &worker_id);
        job.heartbeats.remove(&worker_id);
        // Results and heartbeats are disjoint by invariant; clearing the
        // result maps here guards against a reorder under concurrency.
        job.results.remove(&worker_id);
        job.usage.remove(&worker_id);
        job.output_files.remove(&worker_id);

        queue.enqueue(WorkUnit {
          customer_id: job.customer_id.clone(),
          task_id: job.task_id.clone(),
        });
        feed.push(ProgressUpdate {
          customer_id: job.customer_id.clone(),
          text: format!("worker {} timed out; reassigning", worker_id),
          timestamp: now,
          status: UpdateStatus::Progress,
          is_completion: false,
          progress: Some(job.progress()),
        });
        events.push(StallEvent {
          customer_id: job.customer_id.clone(),
          task_id: job.task_id.clone(),
          worker_id,
        });
      }
    }
    events
  }

  pub async fn download_snapshot(&self, customer_id: &str) -> Result<DownloadSnapshot, EngineError> {
    let state = self.state.lock().await;
    let Some(job) = state.jobs.get(customer_id) else {
      return Err(EngineError::UnknownJob(customer_id.to_string()));
    };
    if job.is_cancelled {
      return Err(EngineError::Cancelled);
    }
    if !job.is_completed {
      return Err(EngineError::NotReady);
    }

    let mut results: Vec<_> = job.results.iter().map(|(w, b)| (w.clone(), b.clone())).collect();
    let mut usage: Vec<_> = job.usage.iter().map(|(w, b)| (w.clone(), b.clone())).collect();
    let mut outputs: Vec<_> =
      job.output_files.iter().map(|(w, f)| (w.clone(), f.clone())).collect();
    results.sort_by(|a, b| a.0.cmp(&b.0));
    usage.sort_by(|a, b| a.0.cmp(&b.0));
    outputs.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(DownloadSnapshot {
      customer_id: job.customer_id.clone(),
      task_id: job.task_id.clone(),
      customer_name: job.customer_name.clone(),
      num_workers: job.num_workers,
      created_at: job.created_at,
      completed_at: job.completed_at,
      results,
      usage,
      outputs,
    })
  }

  pub async fn job_view(&self, customer_id: &str) -> Option<JobView> {
    let state = self.state.lock().await;
    state.jobs.get(customer_id).map(|job| {
      let mut heartbeat_workers: Vec<String> = job.heartbeats.keys().cloned().collect();
      let mut submitted_workers: Vec<String> = job.results.keys().cloned().collect();
      heartbeat_workers.sort();
      submitted_workers.sort();
      JobView {
        customer_id: job.customer_id.clone(),
        task_id: job.task_id.clone(),
        num_workers: job.num_workers,
        assigned_workers: job.assigned_workers.clone(),
        heartbeat_workers,
        submitted_workers,
        pending_workers: job.pending_workers,
        is_completed: job.is_completed,
        is_cancelled: job.is_cancelled,
      }
    })
  }

  pub async fn queue_depth(&self, customer_id: Option<&str>) -> usize {
    let state = self.state.lock().await;
    match customer_id {
      Some(id) => state.queue.count_for(id),
      None => state.queue.len(),
    }
  }
}

/// Split a dataset into `n` contiguous near-equal slices. Chunk size is
/// `ceil(len / n)`, so the last shard absorbs the remainder and may come
/// out shorter or empty; an empty input yields `n` empty shards.
fn split_dataset(data: &[u8], n: usize) -> Vec<Vec<u8>> {
  if data.is_empty() {
    return vec![Vec::new(); n];
  }
  let chunk = data.len().div_ceil(n);
  (0..n)
    .map(|i| {
      let start = i * chunk;
      if start >= data.len() {
        Vec::new()
      } else {
        data[start..(start + chunk).min(data.len())].to_vec()
      }
    })
    .collect()
}

fn unique_customer_id(jobs: &HashMap<String, Job>, mut micros: i64) -> String {
  loop {
    let candidate = format!("C{}", micros);
    if !jobs.contains_key(&candidate) {
      return candidate;
    }
    micros += 1;
  }
}
