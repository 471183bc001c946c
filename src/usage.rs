use regex::Regex;
use serde::Deserialize;

/// Flattened resource usage for one worker's run. Produced from whatever
/// the worker uploaded; a blob that parses as neither form yields a zeroed
/// record with the raw text preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSummary {
  pub cpu_percent: f64,
  pub memory_mb: f64,
  pub execution_secs: f64,
  pub timestamp: Option<String>,
  pub raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageSample {
  #[serde(default)]
  cpu_percent: f64,
  #[serde(default, rename = "mem_usage_MB")]
  mem_usage_mb: f64,
}

/// Parse a worker usage blob. The JSON form is a per-second sample array
/// (`cpu_percent`, `mem_usage_MB` fields); averages come out of it and the
/// sample count stands in for the execution time in seconds. Anything that
/// is not such an array falls back to line-wise key-value extraction.
pub fn parse_usage(raw: &[u8]) -> UsageSummary {
  if let Ok(samples) = serde_json::from_slice::<Vec<UsageSample>>(raw) {
    if !samples.is_empty() {
      let n = samples.len() as f64;
      let cpu = samples.iter().map(|s| s.cpu_percent).sum::<f64>() / n;
      let mem = samples.iter().map(|s| s.mem_usage_mb).sum::<f64>() / n;
      return UsageSummary {
        cpu_percent: cpu,
        memory_mb: mem,
        execution_secs: n,
        timestamp: None,
        raw: None,
      };
    }
  }
  parse_usage_report(raw)
}

fn parse_usage_report(raw: &[u8]) -> UsageSummary {
  let text = String::from_utf8_lossy(raw);
  let cpu_re = Regex::new(r"(?i)cpu usage:\s*([0-9.]+)\s*%?").unwrap();
  let mem_re = Regex::new(r"(?i)memory usage:\s*([0-9.]+)\s*MB").unwrap();
  let time_re = Regex::new(r"(?i)execution time:\s*([0-9.]+)\s*seconds").unwrap();
  let ts_re = Regex::new(r"(?i)timestamp:\s*(\S.*)").unwrap();

  let capture = |re: &Regex| {
    re.captures(&text)
      .and_then(|c| c.get(1))
      .and_then(|m| m.as_str().trim().parse::<f64>().ok())
  };

  let cpu = capture(&cpu_re);
  let mem = capture(&mem_re);
  let secs = capture(&time_re);
  let timestamp = ts_re
    .captures(&text)
    .and_then(|c| c.get(1))
    .map(|m| m.as_str().trim().to_string());

  if cpu.is_none() && mem.is_none() && secs.is_none() && timestamp.is_none() {
    return UsageSummary {
      cpu_percent: 0.0,
      memory_mb: 0.0,
      execution_secs: 0.0,
      timestamp: None,
      raw: Some(text.into_owned()),
    };
  }

  UsageSummary {
    cpu_percent: cpu.unwrap_or(0.0),
    memory_mb: mem.unwrap_or(0.0),
    execution_secs: secs.unwrap_or(0.0),
    timestamp,
    raw: None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn json_sample_array_averages() {
    let blob = br#"[
      {"timestamp": "2024-03-01 09:00:00", "cpu_percent": 10.0, "mem_usage_MB": 100.0, "mem_percent": 20.0},
      {"timestamp": "2024-03-01 09:00:01", "cpu_percent": 30.0, "mem_usage_MB": 300.0, "mem_percent": 60.0}
    ]"#;
    let summary = parse_usage(blob);
    assert_eq!(summary.cpu_percent, 20.0);
    assert_eq!(summary.memory_mb, 200.0);
    assert_eq!(summary.execution_secs, 2.0);
    assert!(summary.raw.is_none());
  }

  #[test]
  fn plain_text_report_lines() {
    let blob = b"CPU Usage: 42.5%\nMemory Usage: 128.0 MB\nExecution Time: 7 seconds\nTimestamp: 2024-03-01 09:00:00\n";
    let summary = parse_usage(blob);
    assert_eq!(summary.cpu_percent, 42.5);
    assert_eq!(summary.memory_mb, 128.0);
    assert_eq!(summary.execution_secs, 7.0);
    assert_eq!(summary.timestamp.as_deref(), Some("2024-03-01 09:00:00"));
  }

  #[test]
  fn empty_json_array_falls_through_to_zeroes() {
    let summary = parse_usage(b"[]");
    assert_eq!(summary.cpu_percent, 0.0);
    assert_eq!(summary.execution_secs, 0.0);
  }

  #[test]
  fn garbage_keeps_raw_bytes() {
    let summary = parse_usage(b"not a usage report at all");
    assert_eq!(summary.cpu_percent, 0.0);
    assert_eq!(summary.raw.as_deref(), Some("not a usage report at all"));
  }
}
