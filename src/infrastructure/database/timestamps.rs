use chrono::{DateTime, TimeZone, Utc};

// Rows written by older builds stored milliseconds.
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

pub fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub fn from_epoch_lossy(ts: i64) -> DateTime<Utc> {
    let seconds = if ts.abs() >= MILLIS_THRESHOLD {
        log::warn!("[database] Coerced milliseconds timestamp to seconds (ts={ts})");
        ts / 1000
    } else {
        ts
    };

    Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(|| {
        log::warn!("[database] Invalid epoch timestamp (ts={ts}); falling back to epoch");
        DateTime::<Utc>::default()
    })
}

pub fn from_epoch_lossy_opt(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(from_epoch_lossy)
}
