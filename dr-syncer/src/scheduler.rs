//! The scheduler. Drives the replication reconciler in three modes (manual,
//! cron-scheduled, and watch-driven continuous) and computes next-fire
//! times and retry backoff. The time-math here is pure and takes "now" as
//! an argument so it is fully unit-testable without a live clock.

use chrono::{DateTime, Utc};
use dr_syncer_types::ReplicationMode;
use std::time::Duration;

/// Computes the next fire time for a cron-scheduled declaration, strictly
/// after `after`.
pub fn next_fire(cron_expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, crate::util::Error> {
    use std::str::FromStr;
    let schedule = cron::Schedule::from_str(cron_expression)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| crate::util::Error::UserInput(format!("cron expression {cron_expression} has no future fire time")))
}

/// Whether mode + current state call for firing a reconcile pass right now.
/// `manual_trigger_changed` reflects whether the trigger annotation's value
/// differs from the last-observed one recorded in status.
pub fn should_fire(
    mode: &ReplicationMode,
    now: DateTime<Utc>,
    next_sync_time: Option<DateTime<Utc>>,
    manual_trigger_changed: bool,
    background_sync_due: bool,
) -> bool {
    match mode {
        ReplicationMode::Manual => manual_trigger_changed,
        ReplicationMode::Scheduled => next_sync_time.map(|t| now >= t).unwrap_or(true),
        ReplicationMode::Continuous => background_sync_due,
    }
}

/// Exponential backoff with a percentage multiplier and a hard ceiling.
/// Network-class errors are retried this way, bounded by max-retries,
/// initial-backoff, max-backoff, and the multiplier.
pub fn backoff_duration(attempt: u32, initial: Duration, max: Duration, multiplier: f64) -> Duration {
    if attempt == 0 {
        return initial.min(max);
    }
    let scaled = initial.as_secs_f64() * multiplier.powi(attempt as i32);
    Duration::from_secs_f64(scaled).min(max)
}

pub fn retries_exhausted(attempt: u32, max_retries: u32) -> bool {
    attempt >= max_retries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn dt(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn next_fire_advances_past_the_given_instant() {
        let after = dt("2026-07-28T10:00:00Z");
        let fire = next_fire("0 0 * * * *", after).unwrap();
        assert!(fire > after);
        assert_eq!(fire.minute(), 0);
    }

    #[test]
    fn next_fire_rejects_malformed_expression() {
        assert!(next_fire("not a cron expr", Utc.timestamp_opt(0, 0).unwrap()).is_err());
    }

    #[test]
    fn manual_mode_fires_only_on_trigger_change() {
        let now = dt("2026-07-28T10:00:00Z");
        assert!(should_fire(&ReplicationMode::Manual, now, None, true, false));
        assert!(!should_fire(&ReplicationMode::Manual, now, None, false, false));
    }

    #[test]
    fn scheduled_mode_fires_when_next_sync_time_has_passed() {
        let now = dt("2026-07-28T10:00:00Z");
        let due = dt("2026-07-28T09:00:00Z");
        let not_due = dt("2026-07-28T11:00:00Z");
        assert!(should_fire(&ReplicationMode::Scheduled, now, Some(due), false, false));
        assert!(!should_fire(&ReplicationMode::Scheduled, now, Some(not_due), false, false));
    }

    #[test]
    fn scheduled_mode_with_no_recorded_next_sync_time_fires_immediately() {
        let now = dt("2026-07-28T10:00:00Z");
        assert!(should_fire(&ReplicationMode::Scheduled, now, None, false, false));
    }

    #[test]
    fn continuous_mode_fires_only_on_background_sync_due() {
        let now = dt("2026-07-28T10:00:00Z");
        assert!(should_fire(&ReplicationMode::Continuous, now, None, false, true));
        assert!(!should_fire(&ReplicationMode::Continuous, now, None, false, false));
    }

    #[test]
    fn backoff_grows_exponentially_and_saturates_at_max() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let d0 = backoff_duration(0, initial, max, 2.0);
        let d1 = backoff_duration(1, initial, max, 2.0);
        let d2 = backoff_duration(2, initial, max, 2.0);
        let d10 = backoff_duration(10, initial, max, 2.0);
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
        assert_eq!(d10, max);
    }

    #[test]
    fn retries_exhausted_at_the_configured_ceiling() {
        assert!(!retries_exhausted(2, 3));
        assert!(retries_exhausted(3, 3));
        assert!(retries_exhausted(4, 3));
    }
}
