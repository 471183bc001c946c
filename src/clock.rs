//! Time source abstraction. The engine and the fault detector read the
//! current time through a `Clock` so stall detection can be driven
//! deterministically in tests.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Production clock, delegates to `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Test clock with a manually advanced instant.
#[derive(Debug)]
pub struct ManualClock {
  time: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self { time: Mutex::new(start) }
  }

  pub fn advance(&self, by: Duration) {
    let mut time = self.time.lock().unwrap();
    *time += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.time.lock().unwrap() = to;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.time.lock().unwrap()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn system_clock_moves_forward() {
    let clock = SystemClock;
    let before = Utc::now();
    let now = clock.now();
    let after = Utc::now();
    assert!(now >= before && now <= after);
  }

  #[test]
  fn manual_clock_advances_only_on_request() {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);
    assert_eq!(clock.now(), start);

    clock.advance(Duration::seconds(31));
    assert_eq!(clock.now(), start + Duration::seconds(31));
  }
}
