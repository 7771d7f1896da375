//! On-disk timestamp encoding.
//!
//! Every SQLite table stores timestamps as signed Unix-epoch seconds
//! (`INTEGER`, UTC) rather than as SQLite's own `TEXT` datetime format, so
//! that row comparisons and `ORDER BY` stay integer comparisons. `Timestamp`
//! is the single conversion point between that on-disk representation and
//! `chrono::DateTime<Utc>`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A UTC instant, stored on disk as Unix-epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    /// Wrap a raw epoch-seconds value, e.g. one read back from a SQLite row.
    #[must_use]
    pub fn from_epoch_seconds(seconds: i64) -> Self {
        Self(seconds)
    }

    /// The raw epoch-seconds value, for binding into a SQL statement.
    #[must_use]
    pub fn epoch_seconds(&self) -> i64 {
        self.0
    }

    /// Convert to a `chrono` UTC datetime.
    #[must_use]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0).single().unwrap_or_else(Utc::now)
    }

    /// Seconds elapsed between `self` and `other` (`other - self`).
    #[must_use]
    pub fn elapsed_seconds_since(&self, other: Timestamp) -> i64 {
        other.0 - self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }
}
