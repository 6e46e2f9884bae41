//! Wall-clock helpers. All persisted times are unix seconds.

use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Local time for display; falls back to UTC when the offset cannot be
/// determined (e.g. multi-threaded process on some platforms).
pub fn local(t: i64) -> OffsetDateTime {
    let utc = OffsetDateTime::from_unix_timestamp(t).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let offset = UtcOffset::local_offset_at(utc).unwrap_or(UtcOffset::UTC);
    utc.to_offset(offset)
}

/// `HH:MM:SS`
pub fn format_hms(t: i64) -> String {
    let fmt = format_description!("[hour]:[minute]:[second]");
    local(t).format(fmt).unwrap_or_default()
}

/// `Monday, 07. Oct. 2024 13:05:00`
pub fn format_long_date(t: i64) -> String {
    let fmt = format_description!(
        "[weekday], [day]. [month repr:short]. [year] [hour]:[minute]:[second]"
    );
    local(t).format(fmt).unwrap_or_default()
}

/// `YYYY-MM-DD HH:MM`
pub fn format_short(t: i64) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");
    local(t).format(fmt).unwrap_or_default()
}

/// Elapsed seconds as `3d 04:05:06` (days omitted when zero).
pub fn format_elapsed(secs: i64) -> String {
    let secs = secs.max(0);
    let days = secs / 86_400;
    let h = (secs % 86_400) / 3_600;
    let m = (secs % 3_600) / 60;
    let s = secs % 60;
    if days > 0 {
        format!("{days}d {h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}
