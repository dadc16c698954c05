// swarmloc_core/src/types.rs

// --- Core Type Aliases ---
/// Identifier of a swarm member: a drone or a static infrastructure node.
pub type DroneId = u32;

/// Timestamps are integer nanoseconds, so they can key ordered maps exactly.
pub type Timestamp = i64;

pub const NSEC_PER_SEC: Timestamp = 1_000_000_000;

/// Converts a nanosecond duration to seconds.
pub fn ts_to_sec(dt: Timestamp) -> f64 {
    dt as f64 / NSEC_PER_SEC as f64
}

/// Converts seconds to a nanosecond timestamp.
pub fn sec_to_ts(sec: f64) -> Timestamp {
    (sec * NSEC_PER_SEC as f64).round() as Timestamp
}

/// A short, human-readable form of a timestamp (milliseconds, wrapped to six
/// digits). Only used in log lines and diagnostic labels.
pub fn ts_short(ts: Timestamp) -> i64 {
    (ts / 1_000_000) % 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_conversion_round_trip() {
        let ts = sec_to_ts(12.345_678_9);
        assert_eq!(ts, 12_345_678_900);
        assert!((ts_to_sec(ts) - 12.345_678_9).abs() < 1e-12);
    }

    #[test]
    fn test_ts_short_wraps() {
        assert_eq!(ts_short(1_234_567_000_000), 234_567);
    }
}
