//! Canonical generation timestamps: `YYYY-MM-DD--HH:MM:SS`.
//!
//! Fixed width, so string order is chronological order.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d--%H:%M:%S";
const TIMESTAMP_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(String);

impl Timestamp {
    /// Parse a canonical timestamp; anything else yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        if !has_canonical_shape(s) {
            return None;
        }
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()?;
        Some(Self(s.to_string()))
    }

    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self(dt.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Current local time.
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn has_canonical_shape(s: &str) -> bool {
    s.len() == TIMESTAMP_LEN
        && s.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 | 10 | 11 => b == b'-',
            14 | 17 => b == b':',
            _ => b.is_ascii_digit(),
        })
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timestamp::parse(&value).ok_or_else(|| format!("invalid generation timestamp '{}'", value))
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}
