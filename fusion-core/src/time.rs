//! Epoch-time helpers.
//!
//! All persisted timestamps are absolute. Fields named `*_secs` or documented
//! as timelocks are seconds since the Unix epoch; everything else is
//! milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn millis_and_secs_agree() {
        let ms = now_millis();
        let s = now_secs();
        assert!((ms / 1000 - s).abs() <= 1);
    }
}
