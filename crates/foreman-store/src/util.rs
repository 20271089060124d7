use chrono::{SecondsFormat, Utc};

/// RFC 3339 with fixed-width microseconds so TEXT timestamps sort
/// lexicographically.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Nanoseconds since the epoch, for version file names.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
