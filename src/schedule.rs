//! Queue recurrence schedules.
//!
//! Two kinds are supported: a simple repeating interval written as `*/N`
//! (every N seconds) and a full cron calendar expression evaluated with
//! croner.

use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Recurrence definition for a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    /// Repeats every fixed number of seconds (`*/N`).
    Interval { every_secs: u64 },
    /// Cron calendar expression.
    Calendar { expression: String },
}

impl ScheduleKind {
    /// Parses `*/N` as an interval and anything else as a cron expression.
    pub fn parse(text: &str) -> Result<Self, DispatchError> {
        if let Some(secs) = text.strip_prefix("*/").and_then(|s| s.parse::<u64>().ok()) {
            if secs == 0 {
                return Err(DispatchError::InvalidSchedule {
                    expression: text.to_string(),
                    reason: "interval must be at least one second".to_string(),
                });
            }
            return Ok(ScheduleKind::Interval { every_secs: secs });
        }

        match Cron::new(text).parse() {
            Ok(_) => Ok(ScheduleKind::Calendar {
                expression: text.to_string(),
            }),
            Err(e) => Err(DispatchError::InvalidSchedule {
                expression: text.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Next occurrence strictly after `after`, or None when the expression
    /// yields no future instant.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleKind::Interval { every_secs } => {
                after.checked_add_signed(Duration::seconds(*every_secs as i64))
            }
            ScheduleKind::Calendar { expression } => {
                let cron = Cron::new(expression).parse().ok()?;
                cron.find_next_occurrence(&after, false).ok()
            }
        }
    }
}

/// Schedule attached to a queue: the recurrence plus whether document status
/// writes driven by queue processing are suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSchedule {
    pub kind: ScheduleKind,
    pub status_silence: bool,
}

impl QueueSchedule {
    pub fn new(kind: ScheduleKind) -> Self {
        Self {
            kind,
            status_silence: false,
        }
    }

    pub fn with_status_silence(mut self, silence: bool) -> Self {
        self.status_silence = silence;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(
            ScheduleKind::parse("*/30").unwrap(),
            ScheduleKind::Interval { every_secs: 30 }
        );
    }

    #[test]
    fn test_parse_rejects_zero_interval() {
        assert!(ScheduleKind::parse("*/0").is_err());
    }

    #[test]
    fn test_parse_cron_expression() {
        let kind = ScheduleKind::parse("0 2 * * *").unwrap();
        assert!(matches!(kind, ScheduleKind::Calendar { .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ScheduleKind::parse("every day at noon").is_err());
    }

    #[test]
    fn test_interval_next_run() {
        let after = Utc::now();
        let kind = ScheduleKind::Interval { every_secs: 60 };
        assert_eq!(
            kind.next_run_after(after),
            Some(after + Duration::seconds(60))
        );
    }

    #[test]
    fn test_calendar_next_run_is_in_the_future() {
        let after = Utc::now();
        let kind = ScheduleKind::parse("*/5 * * * *").unwrap();
        let next = kind.next_run_after(after).unwrap();
        assert!(next > after);
    }
}
