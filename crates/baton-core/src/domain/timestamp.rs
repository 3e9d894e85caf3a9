//! Timestamp (de)serialization for ledger fields.
//!
//! The ledger is shared with tooling that writes naive local ISO-8601
//! timestamps (`2026-01-10T14:03:11.482113`). We always write RFC 3339 UTC,
//! and read both forms.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognised timestamp '{0}'")]
pub struct TimestampError(pub String);

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one interpreted in the
/// local time zone.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            // DST gaps have no local instant; ambiguous folds take the earlier one.
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|ts| ts.with_timezone(&Utc))
                .ok_or_else(|| TimestampError(raw.to_string()));
        }
    }
    Err(TimestampError(raw.to_string()))
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `Option<DateTime<Utc>>` fields. Empty strings read as `None`.
pub mod option {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_some(&format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(raw) if !raw.trim().is_empty() => {
                parse_timestamp(&raw).map(Some).map_err(D::Error::custom)
            }
            _ => Ok(None),
        }
    }
}

/// `Option<NaiveDate>` fields (`YYYY-MM-DD`). Empty strings read as `None`.
pub mod option_date {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    const FORMAT: &str = "%Y-%m-%d";

    pub fn serialize<S>(value: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(date) => serializer.serialize_some(&date.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(raw) if !raw.trim().is_empty() => NaiveDate::parse_from_str(raw.trim(), FORMAT)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("unrecognised date '{raw}': {e}"))),
            _ => Ok(None),
        }
    }
}
