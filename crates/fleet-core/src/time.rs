//! Wall-clock helpers. Centralized so tests can reason about "now" in one
//! place and so every component agrees on what an ISO-8601 timestamp and a
//! millisecond epoch look like on the wire.

use chrono::{DateTime, Utc};

/// Current time, millisecond epoch. Used for cache TTL bookkeeping
/// (active-device `lastSeen`) where a `DateTime` would be awkward to store
/// in Redis.
pub fn now_ms() -> i64 {
	Utc::now().timestamp_millis()
}

/// Current time as an RFC 3339 / ISO-8601 string with millisecond precision,
/// the format every JSON response envelope's `timestamp` field uses.
pub fn now_iso() -> String {
	Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Renders a `DateTime<Utc>` the same way `now_iso` does, for fields like
/// `expires_at` that are computed ahead of "now".
pub fn to_iso(ts: DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
