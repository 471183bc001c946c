//! Worker node client: claims work units from the dispatch server, runs
//! the code bundle locally, samples resource usage, and uploads the
//! result with a heartbeat running in the background.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as Base64Engine;
use chrono::Utc;
use reqwest::multipart;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{error, info, warn};

const CODE_FILE: &str = "code_file.py";
const DATASET_FILE: &str = "dataset_file.csv";
const REQUIREMENTS_FILE: &str = "requirements.txt";
const PIP_LOG_FILE: &str = "pip_install.log";

// Linux scheduler tick rate; /proc cpu times are reported in these units.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

#[derive(Debug, Clone)]
struct WorkerConfig {
  server_url: String,
  worker_id: String,
  work_dir: PathBuf,
  python_bin: String,
  heartbeat_interval: Duration,
  idle_backoff: Duration,
}

impl WorkerConfig {
  fn from_env() -> Self {
    Self {
      server_url: env::var("SERVER_URL").unwrap_or_else(|_| "http://localhost:5000".into()),
      worker_id: env::var("WORKER_ID")
        .unwrap_or_else(|_| format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8])),
      work_dir: env::var("WORK_DIR").unwrap_or_else(|_| "taskgrid-work".into()).into(),
      python_bin: env::var("PYTHON_BIN").unwrap_or_else(|_| "python3".into()),
      heartbeat_interval: Duration::from_millis(
        env::var("HEARTBEAT_INTERVAL_MS")
          .unwrap_or_else(|_| "5000".into())
          .parse()
          .unwrap_or(5_000),
      ),
      idle_backoff: Duration::from_millis(
        env::var("IDLE_BACKOFF_MS")
          .unwrap_or_else(|_| "5000".into())
          .parse()
          .unwrap_or(5_000),
      ),
    }
  }
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
  #[serde(rename = "taskId")]
  task_id: Option<String>,
  #[serde(rename = "customerId")]
  customer_id: Option<String>,
  #[serde(rename = "workerIndex")]
  worker_index: Option<usize>,
  #[serde(rename = "totalWorkers")]
  total_workers: Option<usize>,
  code: Option<String>,
  dataset: Option<String>,
  requirement: Option<String>,
}

#[derive(Debug)]
struct ClaimedTask {
  task_id: String,
  customer_id: String,
  worker_index: usize,
  total_workers: usize,
  code: Vec<u8>,
  dataset: Vec<u8>,
  requirement: Option<Vec<u8>>,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let config = WorkerConfig::from_env();
  let client = reqwest::Client::new();
  info!(worker_id = %config.worker_id, server = %config.server_url, "worker starting");

  loop {
    if !server_alive(&client, &config).await {
      warn!("server not reachable, retrying");
      tokio::time::sleep(config.idle_backoff).await;
      continue;
    }

    match claim_task(&client, &config).await {
      Ok(Some(task)) => {
        info!(task_id = %task.task_id, customer_id = %task.customer_id,
          worker_index = task.worker_index, total = task.total_workers, "task claimed");
        if let Err(e) = run_task(&client, &config, &task).await {
          error!(task_id = %task.task_id, "task run failed: {:?}", e);
        }
      }
      Ok(None) => {
        tokio::time::sleep(config.idle_backoff).await;
      }
      Err(e) => {
        warn!("claim failed: {:?}", e);
        tokio::time::sleep(config.idle_backoff).await;
      }
    }
  }
}

async fn server_alive(client: &reqwest::Client, config: &WorkerConfig) -> bool {
  let url = format!("{}/areyouthere", config.server_url);
  match client.get(&url).timeout(Duration::from_secs(5)).send().await {
    Ok(resp) => resp
      .json::<serde_json::Value>()
      .await
      .map(|v| v["iamthere"].as_bool().unwrap_or(false))
      .unwrap_or(false),
    Err(_) => false,
  }
}

async fn claim_task(client: &reqwest::Client, config: &WorkerConfig) -> Result<Option<ClaimedTask>> {
  let url = format!("{}/gettask", config.server_url);
  let resp: ClaimResponse = client
    .post(&url)
    .json(&json!({ "workerId": config.worker_id }))
    .timeout(Duration::from_secs(10))
    .send()
    .await?
    .error_for_status()?
    .json()
    .await?;

  let Some(task_id) = resp.task_id else {
    return Ok(None);
  };
  let customer_id = resp.customer_id.ok_or_else(|| anyhow!("claim missing customerId"))?;
  let code = BASE64
    .decode(resp.code.ok_or_else(|| anyhow!("claim missing code"))?)
    .context("decoding code")?;
  let dataset = match resp.dataset {
    Some(b64) => BASE64.decode(b64).context("decoding dataset")?,
    None => Vec::new(),
  };
  let requirement = match resp.requirement {
    Some(b64) => Some(BASE64.decode(b64).context("decoding requirement")?),
    None => None,
  };

  Ok(Some(ClaimedTask {
    task_id,
    customer_id,
    worker_index: resp.worker_index.unwrap_or(0),
    total_workers: resp.total_workers.unwrap_or(1),
    code,
    dataset,
    requirement,
  }))
}

async fn run_task(client: &reqwest::Client, config: &WorkerConfig, task: &ClaimedTask) -> Result<()> {
  let folder = config.work_dir.join(&task.customer_id);
  tokio::fs::create_dir_all(&folder).await.context("creating task folder")?;

  tokio::fs::write(folder.join(CODE_FILE), &task.code).await?;
  if !task.dataset.is_empty() {
    tokio::fs::write(folder.join(DATASET_FILE), &task.dataset).await?;
  }
  if let Some(requirement) = &task.requirement {
    tokio::fs::write(folder.join(REQUIREMENTS_FILE), requirement).await?;
  }

  let heartbeat = tokio::spawn(heartbeat_loop(
    client.clone(),
    config.clone(),
    task.customer_id.clone(),
  ));

  let run = execute_bundle(client, config, task, &folder).await;
  heartbeat.abort();

  let cleanup = tokio::fs::remove_dir_all(&folder).await;
  if let Err(e) = cleanup {
    warn!(folder = %folder.display(), "cleanup failed: {}", e);
  }
  run
}

async fn execute_bundle(
  client: &reqwest::Client,
  config: &WorkerConfig,
  task: &ClaimedTask,
  folder: &Path,
) -> Result<()> {
  if task.requirement.is_some() {
    install_requirements(config, folder).await;
  }

  let mut child = Command::new(&config.python_bin)
    .arg(CODE_FILE)
    .current_dir(folder)
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .context("spawning code bundle")?;

  let stdout = child.stdout.take().expect("stdout piped");
  let stderr = child.stderr.take().expect("stderr piped");
  let stdout_task = tokio::spawn(read_to_end(stdout));
  let stderr_task = tokio::spawn(read_to_end(stderr));

  let mut samples: Vec<serde_json::Value> = Vec::new();
  let mut prev_ticks: u64 = 0;
  let mut ticker = tokio::time::interval(Duration::from_secs(1));
  ticker.tick().await;
  let mut ticks_seen: u64 = 0;
  let mut cancelled = false;

  let exit = loop {
    tokio::select! {
      status = child.wait() => {
        break status.context("waiting for code bundle")?;
      }
      _ = ticker.tick() => {
        if let Some(pid) = child.id() {
          samples.push(sample_process(pid, &mut prev_ticks));
        }
        ticks_seen += 1;
        // The server cannot terminate us; stopping on cancellation is our job.
        if ticks_seen % 5 == 0 && poll_cancelled(client, config, &task.customer_id).await {
          warn!(customer_id = %task.customer_id, "job cancelled, killing bundle");
          let _ = child.kill().await;
          cancelled = true;
          break child.wait().await.context("reaping killed bundle")?;
        }
      }
    }
  };

  let mut result = stdout_task.await.unwrap_or_default();
  let stderr_bytes = stderr_task.await.unwrap_or_default();
  if !stderr_bytes.is_empty() {
    result.extend_from_slice(b"\n--- stderr ---\n");
    result.extend_from_slice(&stderr_bytes);
  }

  if cancelled {
    info!(customer_id = %task.customer_id, "skipping upload for cancelled job");
    return Ok(());
  }

  info!(exit_code = exit.code().unwrap_or(-1), "bundle finished");
  let usage = serde_json::to_vec_pretty(&samples)?;
  let outputs = collect_outputs(folder).await?;
  upload_result(client, config, &task.customer_id, result, usage, outputs).await
}

async fn install_requirements(config: &WorkerConfig, folder: &Path) {
  info!("installing requirements");
  let output = Command::new(&config.python_bin)
    .args(["-m", "pip", "install", "--no-cache-dir", "-r", REQUIREMENTS_FILE])
    .current_dir(folder)
    .output()
    .await;
  match output {
    Ok(out) => {
      let mut log = out.stdout;
      log.extend_from_slice(&out.stderr);
      if let Err(e) = tokio::fs::write(folder.join(PIP_LOG_FILE), &log).await {
        warn!("could not write pip log: {}", e);
      }
      if !out.status.success() {
        warn!("pip install failed, running without dependencies");
      }
    }
    Err(e) => warn!("pip install could not start: {}", e),
  }
}

async fn read_to_end<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
  let mut buffer = Vec::new();
  let _ = reader.read_to_end(&mut buffer).await;
  buffer
}

/// One usage sample from /proc. Unreadable fields come back as zeroes so
/// the log stays a well-formed sample array on every platform.
fn sample_process(pid: u32, prev_ticks: &mut u64) -> serde_json::Value {
  let (cpu_percent, mem_mb) = read_proc_stats(pid, prev_ticks).unwrap_or((0.0, 0.0));
  json!({
    "timestamp": Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    "cpu_percent": (cpu_percent * 100.0).round() / 100.0,
    "mem_usage_MB": (mem_mb * 100.0).round() / 100.0,
  })
}

fn read_proc_stats(pid: u32, prev_ticks: &mut u64) -> Option<(f64, f64)> {
  let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
  // Fields after the parenthesized command name; utime and stime are the
  // 12th and 13th of those.
  let rest = &stat[stat.rfind(')')? + 2..];
  let fields: Vec<&str> = rest.split_whitespace().collect();
  let utime: u64 = fields.get(11)?.parse().ok()?;
  let stime: u64 = fields.get(12)?.parse().ok()?;
  let ticks = utime + stime;
  let delta = ticks.saturating_sub(*prev_ticks);
  *prev_ticks = ticks;
  let cpu_percent = delta as f64 * 100.0 / CLOCK_TICKS_PER_SEC;

  let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
  let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
  let mem_mb = rss_pages as f64 * 4096.0 / (1024.0 * 1024.0);

  Some((cpu_percent, mem_mb))
}

async fn poll_cancelled(client: &reqwest::Client, config: &WorkerConfig, customer_id: &str) -> bool {
  let url = format!("{}/iscancelled", config.server_url);
  match client
    .post(&url)
    .json(&json!({ "customerId": customer_id }))
    .timeout(Duration::from_secs(5))
    .send()
    .await
  {
    Ok(resp) => resp
      .json::<serde_json::Value>()
      .await
      .map(|v| v["cancel"].as_bool().unwrap_or(false))
      .unwrap_or(false),
    Err(_) => false,
  }
}

/// Everything the bundle left behind in its folder, minus the inputs we
/// wrote, goes back to the server as an output file.
async fn collect_outputs(folder: &Path) -> Result<Vec<(String, Vec<u8>)>> {
  let inputs: HashSet<&str> =
    [CODE_FILE, DATASET_FILE, REQUIREMENTS_FILE, PIP_LOG_FILE].into_iter().collect();
  let mut outputs = Vec::new();
  let mut entries = tokio::fs::read_dir(folder).await?;
  while let Some(entry) = entries.next_entry().await? {
    if !entry.file_type().await?.is_file() {
      continue;
    }
    let name = entry.file_name().to_string_lossy().into_owned();
    if inputs.contains(name.as_str()) {
      continue;
    }
    let data = tokio::fs::read(entry.path()).await?;
    outputs.push((name, data));
  }
  Ok(outputs)
}

async fn upload_result(
  client: &reqwest::Client,
  config: &WorkerConfig,
  customer_id: &str,
  result: Vec<u8>,
  usage: Vec<u8>,
  outputs: Vec<(String, Vec<u8>)>,
) -> Result<()> {
  let mut form = multipart::Form::new()
    .text("workerId", config.worker_id.clone())
    .text("customerId", customer_id.to_string())
    .part("result", multipart::Part::bytes(result).file_name("result_output.txt"))
    .part("usage", multipart::Part::bytes(usage).file_name("usage_log.txt"));
  for (name, data) in outputs {
    form = form.part(format!("output_{}", name), multipart::Part::bytes(data).file_name(name));
  }

  let url = format!("{}/uploadresult", config.server_url);
  let resp = client
    .post(&url)
    .multipart(form)
    .timeout(Duration::from_secs(30))
    .send()
    .await?
    .error_for_status()?
    .json::<serde_json::Value>()
    .await?;
  info!(
    pending = resp["pendingWorkers"].as_u64().unwrap_or(0),
    completed = resp["completed"].as_bool().unwrap_or(false),
    "result uploaded"
  );
  Ok(())
}

async fn heartbeat_loop(client: reqwest::Client, config: WorkerConfig, customer_id: String) {
  let url = format!("{}/heartbeat", config.server_url);
  let mut ticker = tokio::time::interval(config.heartbeat_interval);
  loop {
    ticker.tick().await;
    let resp = client
      .post(&url)
      .json(&json!({ "workerId": config.worker_id, "customerId": customer_id }))
      .timeout(Duration::from_secs(5))
      .send()
      .await;
    match resp {
      Ok(resp) => {
        let ok = resp
          .json::<serde_json::Value>()
          .await
          .map(|v| v["ok"].as_bool().unwrap_or(false))
          .unwrap_or(false);
        if !ok {
          warn!(customer_id = %customer_id, "heartbeat not accepted");
        }
      }
      Err(e) => warn!("heartbeat error: {}", e),
    }
  }
}
