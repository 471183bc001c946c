use std::convert::Infallible;
use std::sync::Arc;

use bytes::BufMut;
use futures::TryStreamExt;
use serde_json::json;
use warp::http::StatusCode;
use warp::multipart::Part;
use warp::{Filter, Rejection, Reply};

use crate::audit::SharedAudit;
use crate::engine::Engine;
use crate::error::EngineError;

pub mod client;
pub mod sse;
pub mod worker;

pub fn routes(
  engine: Arc<Engine>,
  audit: SharedAudit,
) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  client::routes(engine.clone(), audit.clone())
    .or(worker::routes(engine.clone(), audit))
    .or(sse::sse_route(engine))
}

pub(crate) fn with_engine(
  engine: Arc<Engine>,
) -> impl Filter<Extract = (Arc<Engine>,), Error = Infallible> + Clone {
  warp::any().map(move || engine.clone())
}

pub(crate) fn with_audit(
  audit: SharedAudit,
) -> impl Filter<Extract = (SharedAudit,), Error = Infallible> + Clone {
  warp::any().map(move || audit.clone())
}

pub(crate) async fn part_bytes(part: Part) -> Result<Vec<u8>, Rejection> {
  part
    .stream()
    .try_fold(Vec::new(), |mut bytes, data| async move {
      bytes.put(data);
      Ok(bytes)
    })
    .await
    .map_err(|e| {
      warp::reject::custom(EngineError::Validation(format!("failed reading upload part: {}", e)))
    })
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, code, message) = if let Some(e) = err.find::<EngineError>() {
    let status = match e {
      EngineError::Validation(_) => StatusCode::BAD_REQUEST,
      EngineError::UnknownJob(_) => StatusCode::NOT_FOUND,
      EngineError::Unauthorized => StatusCode::FORBIDDEN,
      EngineError::Cancelled => StatusCode::GONE,
      EngineError::NotReady => StatusCode::PRECONDITION_FAILED,
      EngineError::Duplicate => StatusCode::CONFLICT,
      EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.code(), e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not-found", "no such route".to_string())
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, "validation", "upload too large".to_string())
  } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
    (StatusCode::BAD_REQUEST, "validation", "malformed request body".to_string())
  } else {
    tracing::error!("unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error".to_string())
  };

  Ok(warp::reply::with_status(
    warp::reply::json(&json!({ "code": code, "error": message })),
    status,
  ))
}
