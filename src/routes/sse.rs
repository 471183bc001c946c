use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use warp::{Filter, Rejection};

use super::with_engine;
use crate::engine::Engine;

/// Live status stream: one event every couple of seconds with the current
/// submission progress, until the client disconnects.
pub fn sse_route(
  engine: Arc<Engine>,
) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  warp::path("sse")
    .and(warp::get())
    .and(warp::query::<std::collections::HashMap<String, String>>())
    .and(with_engine(engine))
    .and_then(handle_sse)
}

async fn handle_sse(
  query: std::collections::HashMap<String, String>,
  engine: Arc<Engine>,
) -> Result<impl warp::Reply, Rejection> {
  let customer_id = query
    .get("customer_id")
    .ok_or_else(|| {
      warp::reject::custom(crate::error::EngineError::Validation("missing customer_id".into()))
    })?
    .clone();

  let interval = IntervalStream::new(tokio::time::interval(Duration::from_secs(2)));
  let stream = interval
    .then(move |_| {
      let engine = engine.clone();
      let customer_id = customer_id.clone();
      async move {
        match engine.status(&customer_id).await {
          Ok(status) => {
            let event = warp::sse::Event::default().data(
              json!({
                "customerId": customer_id,
                "submitted": status.submitted,
                "total": status.total,
                "percentage": status.percentage,
                "isCompleted": status.is_completed,
                "isCancelled": status.is_cancelled,
              })
              .to_string(),
            );
            Some(Ok::<_, Infallible>(event))
          }
          Err(_) => None,
        }
      }
    })
    .filter_map(|event| event);

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
