use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("invalid request: {0}")]
  Validation(String),

  #[error("unknown job: {0}")]
  UnknownJob(String),

  #[error("worker is not assigned to this job")]
  Unauthorized,

  #[error("job is cancelled")]
  Cancelled,

  #[error("results are not ready yet")]
  NotReady,

  #[error("result already submitted for this job")]
  Duplicate,

  #[error("internal error: {0}")]
  Internal(String),
}

impl EngineError {
  /// Stable machine-readable tag, one per taxonomy entry.
  pub fn code(&self) -> &'static str {
    match self {
      EngineError::Validation(_) => "validation",
      EngineError::UnknownJob(_) => "unknown-job",
      EngineError::Unauthorized => "unauthorized",
      EngineError::Cancelled => "cancelled",
      EngineError::NotReady => "not-ready",
      EngineError::Duplicate => "duplicate",
      EngineError::Internal(_) => "internal",
    }
  }
}

impl warp::reject::Reject for EngineError {}

pub type Result<T> = std::result::Result<T, EngineError>;
