// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Wall clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// The current time in UTC.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Nanoseconds since the unix epoch of `timestamp`, or of now if unset.
pub fn timestamp_to_nanos(timestamp: Option<SystemTime>) -> u128 {
    let timestamp = timestamp.unwrap_or_else(SystemTime::now);
    // A clock set before 1970 is treated as the epoch.
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_timestamp_to_nanos() {
        let ts = UNIX_EPOCH + Duration::from_secs(3);
        assert_eq!(timestamp_to_nanos(Some(ts)), 3_000_000_000);
        assert!(timestamp_to_nanos(None) > 0);
    }
}
