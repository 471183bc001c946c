use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::ProgressUpdate;

/// How long a non-terminal update stays in the buffer after being drained.
const RETENTION_SECS: i64 = 60;

/// Per-customer append-only update buffers, consumed through a pull
/// endpoint. Draining returns the whole buffer, then prunes it: completion
/// entries are sticky so a late poll still observes the terminal state,
/// everything else ages out after sixty seconds.
#[derive(Debug, Default)]
pub struct ProgressFeed {
  buffers: HashMap<String, Vec<ProgressUpdate>>,
}

impl ProgressFeed {
  pub fn new() -> Self {
    Self { buffers: HashMap::new() }
  }

  pub fn push(&mut self, update: ProgressUpdate) {
    self.buffers.entry(update.customer_id.clone()).or_default().push(update);
  }

  pub fn drain(&mut self, customer_id: &str, now: DateTime<Utc>) -> Vec<ProgressUpdate> {
    let Some(buffer) = self.buffers.get_mut(customer_id) else {
      return Vec::new();
    };
    let drained = buffer.clone();
    let cutoff = now - Duration::seconds(RETENTION_SECS);
    buffer.retain(|u| u.is_completion || u.timestamp > cutoff);
    drained
  }

  pub fn clear(&mut self, customer_id: &str) {
    self.buffers.remove(customer_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::UpdateStatus;
  use chrono::TimeZone;

  fn update(customer: &str, text: &str, at: DateTime<Utc>, completion: bool) -> ProgressUpdate {
    ProgressUpdate {
      customer_id: customer.into(),
      text: text.into(),
      timestamp: at,
      status: if completion { UpdateStatus::Completed } else { UpdateStatus::Progress },
      is_completion: completion,
      progress: None,
    }
  }

  #[test]
  fn drain_returns_buffer_in_insertion_order() {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut feed = ProgressFeed::new();
    feed.push(update("c1", "queued", t0, false));
    feed.push(update("c1", "assigned", t0, false));

    let drained = feed.drain("c1", t0);
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].text, "queued");
    assert_eq!(drained[1].text, "assigned");
  }

  #[test]
  fn recent_entries_survive_a_drain() {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut feed = ProgressFeed::new();
    feed.push(update("c1", "queued", t0, false));

    feed.drain("c1", t0 + Duration::seconds(10));
    let again = feed.drain("c1", t0 + Duration::seconds(20));
    assert_eq!(again.len(), 1, "entry younger than retention is re-delivered");
  }

  #[test]
  fn old_entries_age_out_but_completion_sticks() {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut feed = ProgressFeed::new();
    feed.push(update("c1", "queued", t0, false));
    feed.push(update("c1", "all workers finished", t0, true));

    feed.drain("c1", t0 + Duration::seconds(120));
    let late = feed.drain("c1", t0 + Duration::seconds(240));
    assert_eq!(late.len(), 1);
    assert!(late[0].is_completion);
  }

  #[test]
  fn cancelled_entries_are_not_sticky() {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut feed = ProgressFeed::new();
    let mut cancelled = update("c1", "cancelled by client", t0, false);
    cancelled.status = UpdateStatus::Cancelled;
    feed.push(cancelled);

    feed.drain("c1", t0 + Duration::seconds(120));
    let late = feed.drain("c1", t0 + Duration::seconds(240));
    assert!(late.is_empty());
  }

  #[test]
  fn clear_removes_the_buffer() {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut feed = ProgressFeed::new();
    feed.push(update("c1", "queued", t0, true));
    feed.clear("c1");
    assert!(feed.drain("c1", t0).is_empty());
  }
}
