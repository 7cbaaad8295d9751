// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Wire timestamp. All protocol frames and persisted records carry integer
/// milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn from_millis(millis: i64) -> Self {
        // Out-of-range values clamp to the epoch rather than poisoning the
        // record that carries them.
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or_default())
    }

    pub fn has_expired(&self) -> bool {
        self.0 < Utc::now()
    }

    pub fn elapsed(&self) -> Duration {
        Utc::now() - self.0
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self(Utc.timestamp_millis_opt(0).unwrap())
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<i64> for TimeStamp {
    fn from(millis: i64) -> Self {
        Self::from_millis(millis)
    }
}

impl From<TimeStamp> for i64 {
    fn from(value: TimeStamp) -> Self {
        value.as_millis()
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let ts = TimeStamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.as_millis(), 1_700_000_000_123);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "1700000000123");
        let back: TimeStamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn expiry() {
        assert!(TimeStamp::from_millis(0).has_expired());
        assert!(!TimeStamp::from_millis(i64::MAX / 2).has_expired());
    }
}
