//! Naming stamps for staged jobs and archives.
//!
//! Member and archive names embed a wall-clock stamp and are parsed back by
//! splitting on the reserved `__` delimiter, which is why the delimiter is
//! banned from user-facing identifiers. Stamps come from a process-wide
//! strictly increasing millisecond source, two jobs added back to back
//! inside the same millisecond still get distinct, lexically sortable
//! names.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// reserved field separator in archive and member names
pub const DELIMITER: &str = "__";

/// last millisecond handed out, enforces the minimum spacing between stamps
static LAST_STAMP_MS: Lazy<Mutex<i64>> = Lazy::new(|| Mutex::new(0));

pub fn contains_delimiter(name: &str) -> bool {
    name.contains(DELIMITER)
}

fn next_unique_ms() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_STAMP_MS.lock();
    let next = if now > *last { now } else { *last + 1 };
    *last = next;
    next
}

/// strictly increasing millisecond stamp, `2025-03-01_14-07-59-123`
pub fn unique_stamp() -> String {
    let ms = next_unique_ms();
    // in range by construction, the wall clock is well past the epoch
    let stamp = DateTime::<Utc>::from_timestamp_millis(ms).unwrap();
    stamp.format("%Y-%m-%d_%H-%M-%S-%3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn delimiter_detection() {
        assert!(contains_delimiter("my__study"));
        assert!(!contains_delimiter("my_study"));
    }

    #[test]
    fn stamps_are_unique_and_sorted_even_within_one_millisecond() {
        // far more calls than can spread over distinct milliseconds
        let stamps = (0..256).map(|_| unique_stamp()).collect_vec();
        assert_eq!(stamps.iter().unique().count(), stamps.len());

        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(sorted, stamps, "stamps must sort in issue order");
    }

    #[test]
    fn stamp_format_is_fixed_width() {
        let stamp = unique_stamp();
        assert_eq!(stamp.len(), "2025-03-01_14-07-59-123".len());
        assert!(!contains_delimiter(&stamp));
    }
}
