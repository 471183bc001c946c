use std::io::Read;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use taskgrid::archive::build_archive;
use taskgrid::clock::ManualClock;
use taskgrid::engine::{Engine, NewJob};
use taskgrid::error::EngineError;
use taskgrid::models::{Assignment, ClaimOutcome, OutputFile, SubmitOutcome};

const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

fn setup() -> (Arc<Engine>, Arc<ManualClock>) {
  let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
  let clock = Arc::new(ManualClock::new(start));
  let engine = Arc::new(Engine::new(clock.clone(), HEARTBEAT_TIMEOUT_MS));
  (engine, clock)
}

fn job(code: &[u8], dataset: Option<&[u8]>, num_workers: usize) -> NewJob {
  NewJob {
    customer_name: "acme".into(),
    code: code.to_vec(),
    dataset: dataset.map(|d| d.to_vec()),
    requirement: None,
    num_workers,
  }
}

async fn claim_assigned(engine: &Engine, worker_id: &str) -> Assignment {
  match engine.claim(worker_id).await {
    ClaimOutcome::Assigned(assignment) => *assignment,
    other => panic!("expected an assignment for {}, got {:?}", worker_id, other),
  }
}

async fn submit_simple(engine: &Engine, worker_id: &str, customer_id: &str, result: &[u8]) -> SubmitOutcome {
  engine
    .submit(worker_id, customer_id, result.to_vec(), b"[]".to_vec(), Vec::new())
    .await
}

#[tokio::test]
async fn happy_path_two_workers() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 2)).await.unwrap();
  assert_eq!(ticket.num_workers, 2);

  let a1 = claim_assigned(&engine, "W1").await;
  let a2 = claim_assigned(&engine, "W2").await;
  assert_eq!(a1.worker_index, 0);
  assert_eq!(a2.worker_index, 1);
  assert_eq!(a1.code, b"print(1)");
  assert!(a1.dataset.is_empty(), "no dataset submitted, shard must be empty");
  assert_eq!(a1.total_workers, 2);

  let usage = br#"[{"cpu_percent": 12.0, "mem_usage_MB": 64.0}]"#;
  let first = engine
    .submit("W1", &ticket.customer_id, b"one".to_vec(), usage.to_vec(), Vec::new())
    .await;
  assert!(matches!(first, SubmitOutcome::Accepted { completed: false, .. }));

  let outputs = vec![OutputFile { name: "plot.png".into(), data: vec![9, 9] }];
  let second = engine
    .submit("W2", &ticket.customer_id, b"two".to_vec(), usage.to_vec(), outputs)
    .await;
  assert!(matches!(second, SubmitOutcome::Accepted { completed: true, .. }));

  let status = engine.status(&ticket.customer_id).await.unwrap();
  assert_eq!(status.submitted, 2);
  assert_eq!(status.total, 2);
  assert_eq!(status.percentage, 100);
  assert!(status.is_completed);
  assert!(!status.is_cancelled);
  assert!(status.can_download);

  let snapshot = engine.download_snapshot(&ticket.customer_id).await.unwrap();
  let bytes = build_archive(&snapshot).unwrap();
  let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
  for name in [
    "results/worker_W1_result.txt",
    "results/worker_W2_result.txt",
    "usage/worker_W1_usage.txt",
    "usage/worker_W2_usage.txt",
    "output/W2/plot.png",
    "task_summary.txt",
    "metadata.json",
  ] {
    assert!(archive.by_name(name).is_ok(), "archive missing {}", name);
  }
  let mut result = String::new();
  archive
    .by_name("results/worker_W1_result.txt")
    .unwrap()
    .read_to_string(&mut result)
    .unwrap();
  assert_eq!(result, "one");

  let view = engine.drain_updates(&ticket.customer_id).await.unwrap();
  assert!(view.is_completed);
  let completion: Vec<_> = view.updates.iter().filter(|u| u.is_completion).collect();
  assert_eq!(completion.len(), 1);
}

#[tokio::test]
async fn stalled_worker_is_evicted_and_replaced() {
  let (engine, clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 1)).await.unwrap();

  claim_assigned(&engine, "W1").await;
  clock.advance(Duration::seconds(31));

  let events = engine.sweep_stale().await;
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].worker_id, "W1");
  assert_eq!(events[0].customer_id, ticket.customer_id);

  let view = engine.job_view(&ticket.customer_id).await.unwrap();
  assert!(view.assigned_workers.is_empty());
  assert!(view.heartbeat_workers.is_empty());
  assert_eq!(engine.queue_depth(Some(&ticket.customer_id)).await, 1);

  // The evicted worker lost its slot entirely.
  let late = submit_simple(&engine, "W1", &ticket.customer_id, b"late").await;
  assert_eq!(late, SubmitOutcome::Unauthorized);

  let replacement = claim_assigned(&engine, "W2").await;
  assert_eq!(replacement.worker_index, 0);
  let done = submit_simple(&engine, "W2", &ticket.customer_id, b"done").await;
  assert!(matches!(done, SubmitOutcome::Accepted { completed: true, .. }));

  let view = engine.drain_updates(&ticket.customer_id).await.unwrap();
  let timed_out = view.updates.iter().position(|u| u.text.contains("timed out"));
  let completed = view.updates.iter().position(|u| u.is_completion);
  assert!(timed_out.is_some(), "expected a timeout update");
  assert!(completed.is_some(), "expected a completion update");
  assert!(timed_out.unwrap() < completed.unwrap());
}

#[tokio::test]
async fn fresh_heartbeat_keeps_the_slot() {
  let (engine, clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 1)).await.unwrap();
  claim_assigned(&engine, "W1").await;

  clock.advance(Duration::seconds(20));
  assert!(engine.heartbeat("W1", &ticket.customer_id).await);

  clock.advance(Duration::seconds(20));
  assert!(engine.sweep_stale().await.is_empty(), "beat is 20s old, under the threshold");

  clock.advance(Duration::seconds(11));
  assert_eq!(engine.sweep_stale().await.len(), 1);
}

#[tokio::test]
async fn cancellation_mid_flight() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 3)).await.unwrap();

  claim_assigned(&engine, "W1").await;
  claim_assigned(&engine, "W2").await;
  let done = submit_simple(&engine, "W1", &ticket.customer_id, b"one").await;
  assert!(matches!(done, SubmitOutcome::Accepted { .. }));

  engine.cancel(&ticket.customer_id).await.unwrap();

  let status = engine.status(&ticket.customer_id).await.unwrap();
  assert!(status.is_cancelled);
  assert!(!status.is_completed);
  assert!(!status.can_download);
  assert_eq!(engine.queue_depth(Some(&ticket.customer_id)).await, 0, "queued unit removed");

  let rejected = submit_simple(&engine, "W2", &ticket.customer_id, b"two").await;
  assert_eq!(rejected, SubmitOutcome::Cancelled);

  let download = engine.download_snapshot(&ticket.customer_id).await;
  assert!(matches!(download, Err(EngineError::Cancelled)));

  assert!(!engine.heartbeat("W2", &ticket.customer_id).await);
  assert!(engine.is_cancel_requested(&ticket.customer_id).await);

  let view = engine.drain_updates(&ticket.customer_id).await.unwrap();
  assert!(view.updates.iter().any(|u| u.text.contains("cancelled")));
}

#[tokio::test]
async fn duplicate_submission_is_rejected() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 1)).await.unwrap();
  claim_assigned(&engine, "W1").await;

  let first = submit_simple(&engine, "W1", &ticket.customer_id, b"original").await;
  assert!(matches!(first, SubmitOutcome::Accepted { .. }));
  let before = engine.job_view(&ticket.customer_id).await.unwrap();

  let second = submit_simple(&engine, "W1", &ticket.customer_id, b"replacement").await;
  assert_eq!(second, SubmitOutcome::Duplicate);

  let after = engine.job_view(&ticket.customer_id).await.unwrap();
  assert_eq!(after.pending_workers, before.pending_workers);

  let snapshot = engine.download_snapshot(&ticket.customer_id).await.unwrap();
  assert_eq!(snapshot.results[0].1, b"original".to_vec(), "stored result untouched");
}

#[tokio::test]
async fn uneven_dataset_split_across_three_workers() {
  let (engine, _clock) = setup();
  let dataset = b"0123456789";
  let ticket = engine.create_job(job(b"print(1)", Some(dataset), 3)).await.unwrap();

  let a1 = claim_assigned(&engine, "W1").await;
  let a2 = claim_assigned(&engine, "W2").await;
  let a3 = claim_assigned(&engine, "W3").await;

  assert_eq!(a1.dataset.len(), 4);
  assert_eq!(a2.dataset.len(), 4);
  assert_eq!(a3.dataset.len(), 2);

  let mut joined = a1.dataset.clone();
  joined.extend_from_slice(&a2.dataset);
  joined.extend_from_slice(&a3.dataset);
  assert_eq!(joined, dataset.to_vec());

  let indexes = [a1.worker_index, a2.worker_index, a3.worker_index];
  assert_eq!(indexes, [0, 1, 2]);
  assert_eq!(ticket.num_workers, 3);
}

#[tokio::test]
async fn claim_after_job_deletion_consumes_the_stale_unit() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 1)).await.unwrap();
  assert_eq!(engine.queue_depth(None).await, 1);

  assert!(engine.delete_job(&ticket.customer_id).await);
  assert_eq!(engine.queue_depth(None).await, 1, "unit sits in the queue after deletion");

  let outcome = engine.claim("W1").await;
  assert!(matches!(outcome, ClaimOutcome::NoWork));
  assert_eq!(engine.queue_depth(None).await, 0, "stale unit was consumed");

  assert!(matches!(
    engine.status(&ticket.customer_id).await,
    Err(EngineError::UnknownJob(_))
  ));
}

#[tokio::test]
async fn work_units_are_conserved() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 3)).await.unwrap();
  let customer_id = ticket.customer_id.as_str();

  let conserved = |queued: usize, live: usize, submitted: usize| queued + live + submitted == 3;

  assert!(conserved(engine.queue_depth(Some(customer_id)).await, 0, 0));

  claim_assigned(&engine, "W1").await;
  let view = engine.job_view(customer_id).await.unwrap();
  assert!(conserved(
    engine.queue_depth(Some(customer_id)).await,
    view.heartbeat_workers.len(),
    view.submitted_workers.len(),
  ));

  submit_simple(&engine, "W1", customer_id, b"one").await;
  let view = engine.job_view(customer_id).await.unwrap();
  assert!(conserved(
    engine.queue_depth(Some(customer_id)).await,
    view.heartbeat_workers.len(),
    view.submitted_workers.len(),
  ));
}

#[tokio::test]
async fn heartbeat_set_tracks_assignment_minus_results() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 2)).await.unwrap();
  let customer_id = ticket.customer_id.as_str();

  assert!(!engine.heartbeat("W1", customer_id).await, "unassigned worker gets ok=false");

  claim_assigned(&engine, "W1").await;
  let view = engine.job_view(customer_id).await.unwrap();
  assert_eq!(view.heartbeat_workers, vec!["W1".to_string()]);

  submit_simple(&engine, "W1", customer_id, b"one").await;
  let view = engine.job_view(customer_id).await.unwrap();
  assert!(view.heartbeat_workers.is_empty(), "submission clears the heartbeat");
  assert_eq!(view.submitted_workers, vec!["W1".to_string()]);

  // Still assigned and already submitted: acknowledged without state change.
  assert!(engine.heartbeat("W1", customer_id).await);
  let view = engine.job_view(customer_id).await.unwrap();
  assert!(view.heartbeat_workers.is_empty());
}

#[tokio::test]
async fn completion_and_cancellation_are_terminal_and_exclusive() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 1)).await.unwrap();
  claim_assigned(&engine, "W1").await;
  submit_simple(&engine, "W1", &ticket.customer_id, b"one").await;

  let status = engine.status(&ticket.customer_id).await.unwrap();
  assert!(status.is_completed);

  // Cancelling a finished job is a no-op.
  engine.cancel(&ticket.customer_id).await.unwrap();
  let status = engine.status(&ticket.customer_id).await.unwrap();
  assert!(status.is_completed);
  assert!(!status.is_cancelled);
  assert!(status.can_download);
}

#[tokio::test]
async fn cancelled_job_never_completes() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 1)).await.unwrap();
  claim_assigned(&engine, "W1").await;
  engine.cancel(&ticket.customer_id).await.unwrap();

  let rejected = submit_simple(&engine, "W1", &ticket.customer_id, b"one").await;
  assert_eq!(rejected, SubmitOutcome::Cancelled);

  let status = engine.status(&ticket.customer_id).await.unwrap();
  assert!(status.is_cancelled);
  assert!(!status.is_completed);
}

#[tokio::test]
async fn stalled_job_is_left_alone_once_cancelled() {
  let (engine, clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 1)).await.unwrap();
  claim_assigned(&engine, "W1").await;
  engine.cancel(&ticket.customer_id).await.unwrap();

  clock.advance(Duration::seconds(60));
  assert!(engine.sweep_stale().await.is_empty(), "cancelled jobs are not swept");
  assert_eq!(engine.queue_depth(Some(&ticket.customer_id)).await, 0);
}

#[tokio::test]
async fn completion_notification_fires_once_across_rescue() {
  let (engine, clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 2)).await.unwrap();
  let customer_id = ticket.customer_id.clone();

  claim_assigned(&engine, "W1").await;
  claim_assigned(&engine, "W2").await;
  submit_simple(&engine, "W1", &customer_id, b"one").await;

  // W2 stalls and a replacement finishes the job.
  clock.advance(Duration::seconds(31));
  let events = engine.sweep_stale().await;
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].worker_id, "W2");

  let replacement = claim_assigned(&engine, "W3").await;
  assert_eq!(replacement.worker_index, 1);
  let done = submit_simple(&engine, "W3", &customer_id, b"three").await;
  assert!(matches!(done, SubmitOutcome::Accepted { completed: true, .. }));

  let view = engine.drain_updates(&customer_id).await.unwrap();
  assert_eq!(view.updates.iter().filter(|u| u.is_completion).count(), 1);
}

#[tokio::test]
async fn claims_beyond_capacity_find_no_work() {
  let (engine, _clock) = setup();
  engine.create_job(job(b"print(1)", None, 1)).await.unwrap();
  claim_assigned(&engine, "W1").await;
  assert!(matches!(engine.claim("W2").await, ClaimOutcome::NoWork));
}

#[tokio::test]
async fn same_worker_may_claim_two_units_of_one_job() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", Some(b"abcd"), 2)).await.unwrap();

  let a1 = claim_assigned(&engine, "W1").await;
  let a2 = claim_assigned(&engine, "W1").await;
  assert_eq!(a1.worker_index, 0);
  assert_eq!(a2.worker_index, 1);
  assert_eq!(a1.dataset, b"ab");
  assert_eq!(a2.dataset, b"cd");

  // One submission covers only one of the two claimed slots.
  let outcome = submit_simple(&engine, "W1", &ticket.customer_id, b"one").await;
  assert!(matches!(outcome, SubmitOutcome::Accepted { completed: false, .. }));
  let dup = submit_simple(&engine, "W1", &ticket.customer_id, b"again").await;
  assert_eq!(dup, SubmitOutcome::Duplicate);
}

#[tokio::test]
async fn unknown_job_operations_fail_cleanly() {
  let (engine, _clock) = setup();
  assert!(matches!(engine.status("C404").await, Err(EngineError::UnknownJob(_))));
  assert!(matches!(engine.cancel("C404").await, Err(EngineError::UnknownJob(_))));
  assert!(matches!(engine.drain_updates("C404").await, Err(EngineError::UnknownJob(_))));
  assert_eq!(
    engine.submit("W1", "C404", Vec::new(), Vec::new(), Vec::new()).await,
    SubmitOutcome::UnknownJob
  );
  assert!(!engine.is_cancel_requested("C404").await);
  assert!(!engine.delete_job("C404").await);
}

#[tokio::test]
async fn download_before_completion_is_refused() {
  let (engine, _clock) = setup();
  let ticket = engine.create_job(job(b"print(1)", None, 2)).await.unwrap();
  claim_assigned(&engine, "W1").await;
  submit_simple(&engine, "W1", &ticket.customer_id, b"one").await;

  let download = engine.download_snapshot(&ticket.customer_id).await;
  assert!(matches!(download, Err(EngineError::NotReady)));
}

#[tokio::test]
async fn rejects_empty_code_and_zero_workers() {
  let (engine, _clock) = setup();
  assert!(matches!(
    engine.create_job(job(b"", None, 2)).await,
    Err(EngineError::Validation(_))
  ));
  assert!(matches!(
    engine.create_job(job(b"print(1)", None, 0)).await,
    Err(EngineError::Validation(_))
  ));
}
