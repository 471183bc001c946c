//! Best-effort audit adapter. Usage stats, job rows and per-worker
//! counters land in Postgres when a store is configured; every write is
//! fire-and-forget off the request path and a failure is logged, never
//! surfaced and never rolled back into engine state.

use std::sync::Arc;

use anyhow::Result;
use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{error, info};

use crate::usage::UsageSummary;

static MIGRATOR: Migrator = sqlx::migrate!();

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub type SharedAudit = Option<Arc<AuditStore>>;

pub struct AuditStore {
  pool: Pool<Postgres>,
}

impl AuditStore {
  pub async fn connect(database_url: &str) -> Result<Self> {
    let pool = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
      Pool::<Postgres>::connect(database_url)
    })
    .await?;
    MIGRATOR.run(&pool).await?;
    info!("audit store connected, migrations complete");
    Ok(Self { pool })
  }

  pub async fn record_job(
    &self,
    customer_id: &str,
    task_id: &str,
    customer_name: &str,
    num_workers: usize,
    code: &[u8],
    dataset: Option<&[u8]>,
    requirement: Option<&[u8]>,
  ) -> Result<()> {
    sqlx::query(
      "INSERT INTO files (customer_id, task_id, customer_name, num_workers, code, dataset, requirement)
       VALUES ($1, $2, $3, $4, $5, $6, $7)
       ON CONFLICT (customer_id) DO NOTHING",
    )
    .bind(customer_id)
    .bind(task_id)
    .bind(customer_name)
    .bind(num_workers as i32)
    .bind(code)
    .bind(dataset)
    .bind(requirement)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  pub async fn record_usage(
    &self,
    customer_id: &str,
    worker_id: &str,
    summary: &UsageSummary,
  ) -> Result<()> {
    sqlx::query(
      "INSERT INTO worker_usage_stats (customer_id, worker_id, cpu_percent, memory_mb, execution_secs)
       VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(customer_id)
    .bind(worker_id)
    .bind(summary.cpu_percent)
    .bind(summary.memory_mb)
    .bind(summary.execution_secs)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  /// Apply signed deltas to a worker's counters, floored at zero.
  pub async fn bump_counters(
    &self,
    worker_id: &str,
    pending: i64,
    running: i64,
    completed: i64,
    failed: i64,
  ) -> Result<()> {
    sqlx::query(
      "INSERT INTO resource_provider (worker_id, task_pending, task_running, task_completed, task_failed)
       VALUES ($1, GREATEST($2, 0), GREATEST($3, 0), GREATEST($4, 0), GREATEST($5, 0))
       ON CONFLICT (worker_id) DO UPDATE SET
         task_pending = GREATEST(resource_provider.task_pending + $2, 0),
         task_running = GREATEST(resource_provider.task_running + $3, 0),
         task_completed = GREATEST(resource_provider.task_completed + $4, 0),
         task_failed = GREATEST(resource_provider.task_failed + $5, 0)",
    )
    .bind(worker_id)
    .bind(pending)
    .bind(running)
    .bind(completed)
    .bind(failed)
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}

pub fn job_created(
  audit: &SharedAudit,
  customer_id: String,
  task_id: String,
  customer_name: String,
  num_workers: usize,
  code: Vec<u8>,
  dataset: Option<Vec<u8>>,
  requirement: Option<Vec<u8>>,
) {
  let Some(store) = audit.clone() else { return };
  tokio::spawn(async move {
    if let Err(e) = store
      .record_job(
        &customer_id,
        &task_id,
        &customer_name,
        num_workers,
        &code,
        dataset.as_deref(),
        requirement.as_deref(),
      )
      .await
    {
      error!(%customer_id, "audit job record failed: {:?}", e);
    }
  });
}

pub fn task_assigned(audit: &SharedAudit, worker_id: String) {
  let Some(store) = audit.clone() else { return };
  tokio::spawn(async move {
    if let Err(e) = store.bump_counters(&worker_id, 1, 1, 0, 0).await {
      error!(%worker_id, "audit assignment counters failed: {:?}", e);
    }
  });
}

pub fn task_completed(audit: &SharedAudit, customer_id: String, worker_id: String, summary: UsageSummary) {
  let Some(store) = audit.clone() else { return };
  tokio::spawn(async move {
    if let Err(e) = store.record_usage(&customer_id, &worker_id, &summary).await {
      error!(%customer_id, %worker_id, "audit usage record failed: {:?}", e);
    }
    if let Err(e) = store.bump_counters(&worker_id, -1, -1, 1, 0).await {
      error!(%worker_id, "audit completion counters failed: {:?}", e);
    }
  });
}

pub fn task_stalled(audit: &SharedAudit, worker_id: String) {
  let Some(store) = audit.clone() else { return };
  tokio::spawn(async move {
    if let Err(e) = store.bump_counters(&worker_id, -1, -1, 0, 1).await {
      error!(%worker_id, "audit stall counters failed: {:?}", e);
    }
  });
}
