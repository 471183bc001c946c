use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as Base64Engine;
use futures::TryStreamExt;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use super::{part_bytes, with_audit, with_engine};
use crate::audit::{self, SharedAudit};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::models::{ClaimOutcome, OutputFile, SubmitOutcome};
use crate::usage::parse_usage;

const MAX_UPLOAD_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Deserialize)]
struct ClaimRequest {
  #[serde(rename = "workerId")]
  worker_id: String,
}

#[derive(Deserialize)]
struct HeartbeatRequest {
  #[serde(rename = "workerId")]
  worker_id: String,
  #[serde(rename = "customerId")]
  customer_id: String,
}

#[derive(Deserialize)]
struct CancelPollRequest {
  #[serde(rename = "customerId")]
  customer_id: String,
}

pub fn routes(
  engine: Arc<Engine>,
  audit: SharedAudit,
) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  let claim = warp::path("gettask")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and(with_audit(audit.clone()))
    .and_then(handle_claim);

  let upload = warp::path("uploadresult")
    .and(warp::post())
    .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
    .and(with_engine(engine.clone()))
    .and(with_audit(audit))
    .and_then(handle_upload);

  let heartbeat = warp::path("heartbeat")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_heartbeat);

  let cancel_poll = warp::path("iscancelled")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine))
    .and_then(handle_cancel_poll);

  claim.or(upload).or(heartbeat).or(cancel_poll)
}

async fn handle_claim(
  request: ClaimRequest,
  engine: Arc<Engine>,
  audit: SharedAudit,
) -> Result<impl Reply, Rejection> {
  match engine.claim(&request.worker_id).await {
    ClaimOutcome::NoWork => Ok(warp::reply::json(&json!({ "taskId": null }))),
    ClaimOutcome::Cancelled { customer_id } => Ok(warp::reply::json(&json!({
      "taskId": null,
      "cancelled": true,
      "customerId": customer_id,
    }))),
    ClaimOutcome::Assigned(assignment) => {
      audit::task_assigned(&audit, request.worker_id);
      Ok(warp::reply::json(&json!({
        "taskId": assignment.task_id,
        "customerId": assignment.customer_id,
        "workerIndex": assignment.worker_index,
        "totalWorkers": assignment.total_workers,
        "code": BASE64.encode(&assignment.code),
        "dataset": BASE64.encode(&assignment.dataset),
        "requirement": assignment.requirement.as_ref().map(|r| BASE64.encode(r)),
      })))
    }
  }
}

async fn handle_upload(
  form: FormData,
  engine: Arc<Engine>,
  audit: SharedAudit,
) -> Result<impl Reply, Rejection> {
  let mut worker_id: Option<String> = None;
  let mut customer_id: Option<String> = None;
  let mut result: Option<Vec<u8>> = None;
  let mut usage: Option<Vec<u8>> = None;
  let mut outputs: Vec<OutputFile> = Vec::new();

  let mut parts = form;
  while let Some(part) = parts.try_next().await.map_err(|e| {
    warp::reject::custom(EngineError::Validation(format!("malformed multipart body: {}", e)))
  })? {
    let name = part.name().to_string();
    match name.as_str() {
      "workerId" => worker_id = Some(String::from_utf8_lossy(&part_bytes(part).await?).into_owned()),
      "customerId" => {
        customer_id = Some(String::from_utf8_lossy(&part_bytes(part).await?).into_owned())
      }
      "result" => result = Some(part_bytes(part).await?),
      "usage" => usage = Some(part_bytes(part).await?),
      // Output files arrive as dynamically named fields; the suffix is
      // attacker-controlled and must stay a bare filename.
      _ if name.starts_with("output_") => {
        let filename = name["output_".len()..].to_string();
        if !safe_filename(&filename) {
          return Err(warp::reject::custom(EngineError::Validation(format!(
            "unsafe output filename {:?}",
            filename
          ))));
        }
        outputs.push(OutputFile { name: filename, data: part_bytes(part).await? });
      }
      other => {
        info!(field = other, "ignoring unknown upload field");
      }
    }
  }

  let worker_id = worker_id
    .ok_or_else(|| warp::reject::custom(EngineError::Validation("workerId is required".into())))?;
  let customer_id = customer_id
    .ok_or_else(|| warp::reject::custom(EngineError::Validation("customerId is required".into())))?;
  let result = result
    .ok_or_else(|| warp::reject::custom(EngineError::Validation("result file is required".into())))?;
  let usage = usage
    .ok_or_else(|| warp::reject::custom(EngineError::Validation("usage file is required".into())))?;

  let usage_for_audit = usage.clone();
  let outcome = engine.submit(&worker_id, &customer_id, result, usage, outputs).await;
  match outcome {
    SubmitOutcome::Accepted { submitted, total, pending_workers, completed } => {
      // Usage parsing and the audit write stay off the engine's critical path.
      let summary = parse_usage(&usage_for_audit);
      audit::task_completed(&audit, customer_id, worker_id, summary);
      Ok(warp::reply::json(&json!({
        "resp": true,
        "submitted": submitted,
        "total": total,
        "pendingWorkers": pending_workers,
        "completed": completed,
      })))
    }
    SubmitOutcome::UnknownJob => Err(warp::reject::custom(EngineError::UnknownJob(customer_id))),
    SubmitOutcome::Cancelled => Err(warp::reject::custom(EngineError::Cancelled)),
    SubmitOutcome::Unauthorized => Err(warp::reject::custom(EngineError::Unauthorized)),
    SubmitOutcome::Duplicate => Err(warp::reject::custom(EngineError::Duplicate)),
  }
}

async fn handle_heartbeat(
  request: HeartbeatRequest,
  engine: Arc<Engine>,
) -> Result<impl Reply, Rejection> {
  let ok = engine.heartbeat(&request.worker_id, &request.customer_id).await;
  Ok(warp::reply::json(&json!({ "ok": ok })))
}

async fn handle_cancel_poll(
  request: CancelPollRequest,
  engine: Arc<Engine>,
) -> Result<impl Reply, Rejection> {
  let cancel = engine.is_cancel_requested(&request.customer_id).await;
  Ok(warp::reply::json(&json!({ "cancel": cancel })))
}

fn safe_filename(name: &str) -> bool {
  let re = Regex::new(r"^[\w][\w.\- ]*$").unwrap();
  !name.is_empty() && !name.contains("..") && re.is_match(name)
}

#[cfg(test)]
mod tests {
  use super::safe_filename;

  #[test]
  fn accepts_plain_filenames() {
    assert!(safe_filename("plot.png"));
    assert!(safe_filename("model_weights.bin"));
    assert!(safe_filename("report v2.txt"));
  }

  #[test]
  fn rejects_traversal_and_separators() {
    assert!(!safe_filename("../etc/passwd"));
    assert!(!safe_filename("a/../b"));
    assert!(!safe_filename("dir/file.txt"));
    assert!(!safe_filename(r"dir\file.txt"));
    assert!(!safe_filename(""));
    assert!(!safe_filename(".hidden"));
  }
}
