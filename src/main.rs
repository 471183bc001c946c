use std::sync::Arc;
use std::time::Duration;

use taskgrid::audit::AuditStore;
use taskgrid::clock::SystemClock;
use taskgrid::config::Config;
use taskgrid::engine::Engine;
use taskgrid::{detector, routes};
use tracing::{info, warn};
use warp::Filter;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let config = Config::from_env();

  let audit = match &config.audit_database_url {
    Some(url) => match AuditStore::connect(url).await {
      Ok(store) => Some(Arc::new(store)),
      Err(e) => {
        warn!("audit store unavailable, running without it: {:?}", e);
        None
      }
    },
    None => {
      info!("no AUDIT_DATABASE_URL configured, audit disabled");
      None
    }
  };

  let engine = Arc::new(Engine::new(Arc::new(SystemClock), config.heartbeat_timeout_ms));
  detector::spawn(
    engine.clone(),
    audit.clone(),
    Duration::from_millis(config.sweep_interval_ms),
  );

  let api = routes::routes(engine, audit).recover(routes::handle_rejection);

  info!(port = config.server_port, "taskgrid listening");
  warp::serve(api).run(([0, 0, 0, 0], config.server_port)).await;
}
