use std::env;

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  pub heartbeat_timeout_ms: u64,
  pub sweep_interval_ms: u64,
  pub audit_database_url: Option<String>,
  pub token_secret: Option<String>,
}

impl Config {
  pub fn from_env() -> Self {
    let config = Self {
      server_port: env::var("SERVER_PORT")
        .unwrap_or_else(|_| "5000".into())
        .parse()
        .unwrap_or(5000),
      heartbeat_timeout_ms: env::var("HEARTBEAT_TIMEOUT_MS")
        .unwrap_or_else(|_| "30000".into())
        .parse()
        .unwrap_or(30_000),
      sweep_interval_ms: env::var("SWEEP_INTERVAL_MS")
        .unwrap_or_else(|_| "5000".into())
        .parse()
        .unwrap_or(5_000),
      audit_database_url: env::var("AUDIT_DATABASE_URL").ok(),
      token_secret: env::var("TOKEN_SECRET").ok(),
    };
    // Detection latency is bounded by the sweep period only if it fits twice
    // into the stall threshold.
    assert!(
      config.sweep_interval_ms <= config.heartbeat_timeout_ms / 2,
      "SWEEP_INTERVAL_MS must be at most half of HEARTBEAT_TIMEOUT_MS"
    );
    config
  }
}
