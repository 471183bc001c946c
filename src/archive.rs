use std::io::{Cursor, Write};

use anyhow::{Context, Result};
use serde_json::json;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::engine::DownloadSnapshot;

/// Build the downloadable result archive in memory: one result and usage
/// file per worker, the workers' output files under per-worker folders, a
/// human-readable summary and a JSON manifest.
pub fn build_archive(snapshot: &DownloadSnapshot) -> Result<Vec<u8>> {
  let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
  let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

  for (worker_id, result) in &snapshot.results {
    writer
      .start_file(format!("results/worker_{}_result.txt", worker_id), options)
      .with_context(|| format!("starting result entry for {}", worker_id))?;
    writer.write_all(result)?;
  }

  for (worker_id, usage) in &snapshot.usage {
    writer
      .start_file(format!("usage/worker_{}_usage.txt", worker_id), options)
      .with_context(|| format!("starting usage entry for {}", worker_id))?;
    writer.write_all(usage)?;
  }

  for (worker_id, files) in &snapshot.outputs {
    for file in files {
      writer
        .start_file(format!("output/{}/{}", worker_id, file.name), options)
        .with_context(|| format!("starting output entry {} for {}", file.name, worker_id))?;
      writer.write_all(&file.data)?;
    }
  }

  writer.start_file("task_summary.txt", options)?;
  writer.write_all(summary_text(snapshot).as_bytes())?;

  writer.start_file("metadata.json", options)?;
  let manifest = json!({
    "customerId": snapshot.customer_id,
    "taskId": snapshot.task_id,
    "customerName": snapshot.customer_name,
    "numWorkers": snapshot.num_workers,
    "createdAt": snapshot.created_at,
    "completedAt": snapshot.completed_at,
    "workers": snapshot.results.iter().map(|(worker_id, _)| {
      let outputs: Vec<&str> = snapshot
        .outputs
        .iter()
        .find(|(w, _)| w == worker_id)
        .map(|(_, files)| files.iter().map(|f| f.name.as_str()).collect())
        .unwrap_or_default();
      json!({
        "workerId": worker_id,
        "resultFile": format!("results/worker_{}_result.txt", worker_id),
        "usageFile": format!("usage/worker_{}_usage.txt", worker_id),
        "outputFiles": outputs,
      })
    }).collect::<Vec<_>>(),
  });
  writer.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;

  let cursor = writer.finish().context("finishing archive")?;
  Ok(cursor.into_inner())
}

fn summary_text(snapshot: &DownloadSnapshot) -> String {
  let mut text = String::new();
  text.push_str(&format!("Task {} for customer {} ({})\n", snapshot.task_id, snapshot.customer_name, snapshot.customer_id));
  text.push_str(&format!("Workers: {}\n", snapshot.num_workers));
  text.push_str(&format!("Created: {}\n", snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC")));
  if let Some(completed_at) = snapshot.completed_at {
    text.push_str(&format!("Completed: {}\n", completed_at.format("%Y-%m-%d %H:%M:%S UTC")));
  }
  text.push('\n');
  for (worker_id, result) in &snapshot.results {
    let output_count = snapshot
      .outputs
      .iter()
      .find(|(w, _)| w == worker_id)
      .map(|(_, files)| files.len())
      .unwrap_or(0);
    text.push_str(&format!(
      "worker {}: {} result bytes, {} output file(s)\n",
      worker_id,
      result.len(),
      output_count
    ));
  }
  text
}
