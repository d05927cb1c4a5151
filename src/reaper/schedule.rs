//! Wall-clock interval alignment.
//!
//! Ticks fire on multiples of the interval counted from the Unix epoch, so
//! every process using the same interval reports on the same boundaries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

const NANOS_PER_SEC: u128 = 1_000_000_000;

fn nanos_since_epoch(now: SystemTime) -> u128 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn from_nanos(nanos: u128) -> Duration {
    Duration::new((nanos / NANOS_PER_SEC) as u64, (nanos % NANOS_PER_SEC) as u32)
}

/// Time left until the next interval boundary strictly after `now`.
///
/// `interval` must be non-zero.
pub fn until_next_boundary(now: SystemTime, interval: Duration) -> Duration {
    let interval = interval.as_nanos();
    from_nanos(interval - nanos_since_epoch(now) % interval)
}

/// The latest interval boundary at or before `now`.
///
/// `interval` must be non-zero.
pub fn interval_floor(now: SystemTime, interval: Duration) -> DateTime<Utc> {
    let interval = interval.as_nanos();
    let floored = nanos_since_epoch(now) / interval * interval;
    DateTime::<Utc>::from(UNIX_EPOCH + from_nanos(floored))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64, millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_millis(millis)
    }

    #[test]
    fn test_waits_for_next_multiple_not_full_interval() {
        let interval = Duration::from_secs(60);
        assert_eq!(
            until_next_boundary(at(130, 0), interval),
            Duration::from_secs(50)
        );
        assert_eq!(
            until_next_boundary(at(179, 250), interval),
            Duration::from_millis(750)
        );
    }

    #[test]
    fn test_on_boundary_waits_a_full_interval() {
        let interval = Duration::from_secs(60);
        assert_eq!(until_next_boundary(at(120, 0), interval), interval);
    }

    #[test]
    fn test_sub_second_interval() {
        let interval = Duration::from_millis(250);
        assert_eq!(
            until_next_boundary(at(10, 100), interval),
            Duration::from_millis(150)
        );
        assert_eq!(
            interval_floor(at(10, 600), interval),
            DateTime::<Utc>::from(at(10, 500))
        );
    }

    #[test]
    fn test_floor_aligns_to_epoch_multiples() {
        let interval = Duration::from_secs(60);
        let floor = interval_floor(at(1_000_019, 999), interval);
        assert_eq!(floor.timestamp(), 999_960);
        assert_eq!(floor.timestamp_subsec_nanos(), 0);
    }
}
