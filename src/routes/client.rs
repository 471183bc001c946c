use std::sync::Arc;

use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use super::{part_bytes, with_audit, with_engine};
use crate::archive::build_archive;
use crate::audit::{self, SharedAudit};
use crate::engine::{Engine, NewJob};
use crate::error::EngineError;

const MAX_UPLOAD_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Deserialize)]
struct CustomerRequest {
  #[serde(rename = "customerId")]
  customer_id: String,
}

#[derive(Deserialize)]
struct CustomerQuery {
  customer_id: String,
}

pub fn routes(
  engine: Arc<Engine>,
  audit: SharedAudit,
) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  let submit = warp::path("submittask")
    .and(warp::post())
    .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
    .and(with_engine(engine.clone()))
    .and(with_audit(audit))
    .and_then(handle_submit);

  let updates = warp::path("whatistheupdate")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_updates);

  let status = warp::path("taskstatus")
    .and(warp::get())
    .and(warp::query::<CustomerQuery>())
    .and(with_engine(engine.clone()))
    .and_then(handle_status);

  let cancel = warp::path("canceltask")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_cancel);

  let download = warp::path("downloadresults")
    .and(warp::get())
    .and(warp::query::<CustomerQuery>())
    .and(with_engine(engine.clone()))
    .and_then(handle_download);

  let delete = warp::path("deletetask")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_delete);

  let inspect = warp::path("inspecttask")
    .and(warp::get())
    .and(warp::query::<CustomerQuery>())
    .and(with_engine(engine))
    .and_then(handle_inspect);

  let liveness = warp::path("areyouthere")
    .and(warp::get())
    .map(|| warp::reply::json(&json!({ "iamthere": true })));

  submit
    .or(updates)
    .or(status)
    .or(cancel)
    .or(download)
    .or(delete)
    .or(inspect)
    .or(liveness)
}

async fn handle_submit(
  form: FormData,
  engine: Arc<Engine>,
  audit: SharedAudit,
) -> Result<impl Reply, Rejection> {
  let mut code: Option<Vec<u8>> = None;
  let mut dataset: Option<Vec<u8>> = None;
  let mut requirement: Option<Vec<u8>> = None;
  let mut customer_name: Option<String> = None;
  let mut respn: Option<usize> = None;

  let mut parts = form;
  while let Some(part) = parts.try_next().await.map_err(|e| {
    warp::reject::custom(EngineError::Validation(format!("malformed multipart body: {}", e)))
  })? {
    let name = part.name().to_string();
    match name.as_str() {
      "code" => code = Some(part_bytes(part).await?),
      "dataset" => dataset = Some(part_bytes(part).await?),
      "requirement" => requirement = Some(part_bytes(part).await?),
      "customername" => {
        customer_name = Some(String::from_utf8_lossy(&part_bytes(part).await?).into_owned())
      }
      "respn" => {
        let text = String::from_utf8_lossy(&part_bytes(part).await?).trim().to_string();
        let parsed = text.parse::<usize>().map_err(|_| {
          warp::reject::custom(EngineError::Validation(format!(
            "respn must be a positive integer, got {:?}",
            text
          )))
        })?;
        respn = Some(parsed);
      }
      other => {
        info!(field = other, "ignoring unknown submission field");
      }
    }
  }

  let code = code
    .ok_or_else(|| warp::reject::custom(EngineError::Validation("code file is required".into())))?;
  let num_workers = respn
    .ok_or_else(|| warp::reject::custom(EngineError::Validation("respn field is required".into())))?;
  if num_workers == 0 {
    return Err(warp::reject::custom(EngineError::Validation(
      "respn must be at least 1".into(),
    )));
  }
  let customer_name = customer_name.unwrap_or_else(|| "anonymous".into());

  // The audit row keeps its own copy of the blobs; the engine owns the rest.
  let audit_blobs = (code.clone(), dataset.clone(), requirement.clone());
  let ticket = engine
    .create_job(NewJob {
      customer_name: customer_name.clone(),
      code,
      dataset,
      requirement,
      num_workers,
    })
    .await
    .map_err(warp::reject::custom)?;

  audit::job_created(
    &audit,
    ticket.customer_id.clone(),
    ticket.task_id.clone(),
    customer_name,
    ticket.num_workers,
    audit_blobs.0,
    audit_blobs.1,
    audit_blobs.2,
  );

  Ok(warp::reply::json(&ticket))
}

async fn handle_updates(
  request: CustomerRequest,
  engine: Arc<Engine>,
) -> Result<impl Reply, Rejection> {
  let view = engine
    .drain_updates(&request.customer_id)
    .await
    .map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&json!({
    "updates": view.updates,
    "progress": view.progress,
    "isCompleted": view.is_completed,
  })))
}

async fn handle_status(
  query: CustomerQuery,
  engine: Arc<Engine>,
) -> Result<impl Reply, Rejection> {
  let status = engine.status(&query.customer_id).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&status))
}

async fn handle_cancel(
  request: CustomerRequest,
  engine: Arc<Engine>,
) -> Result<impl Reply, Rejection> {
  engine.cancel(&request.customer_id).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&json!({ "cancelled": true })))
}

async fn handle_download(
  query: CustomerQuery,
  engine: Arc<Engine>,
) -> Result<impl Reply, Rejection> {
  let snapshot = engine
    .download_snapshot(&query.customer_id)
    .await
    .map_err(warp::reject::custom)?;

  // The archive is assembled outside the engine lock.
  let bytes = build_archive(&snapshot).map_err(|e| {
    error!(customer_id = %query.customer_id, "archive build failed: {:?}", e);
    warp::reject::custom(EngineError::Internal("failed to build result archive".into()))
  })?;

  info!(customer_id = %query.customer_id, bytes = bytes.len(), "result archive served");
  let response = warp::http::Response::builder()
    .header("content-type", "application/zip")
    .header(
      "content-disposition",
      format!("attachment; filename=\"results_{}.zip\"", snapshot.customer_id),
    )
    .body(bytes)
    .map_err(|e| warp::reject::custom(EngineError::Internal(e.to_string())))?;
  Ok(response)
}

async fn handle_delete(
  request: CustomerRequest,
  engine: Arc<Engine>,
) -> Result<impl Reply, Rejection> {
  let deleted = engine.delete_job(&request.customer_id).await;
  Ok(warp::reply::json(&json!({ "deleted": deleted })))
}

async fn handle_inspect(
  query: CustomerQuery,
  engine: Arc<Engine>,
) -> Result<impl Reply, Rejection> {
  let view = engine
    .job_view(&query.customer_id)
    .await
    .ok_or_else(|| warp::reject::custom(EngineError::UnknownJob(query.customer_id.clone())))?;
  Ok(warp::reply::json(&view))
}
