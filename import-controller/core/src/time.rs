//! Conversions between API timestamps and `chrono`.
//!
//! API timestamps go through their RFC 3339 wire form, so callers do not
//! depend on the representation the generated types wrap.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

pub fn to_utc(t: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(t).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub fn from_utc(t: DateTime<Utc>) -> Option<Time> {
    serde_json::from_value(serde_json::Value::String(rfc3339(t))).ok()
}

pub fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
