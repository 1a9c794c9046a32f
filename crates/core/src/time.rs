use chrono::{DateTime, SecondsFormat, Utc};

/// A point on the virtual (playback) time axis, in milliseconds since the Unix epoch.
pub type VirtualTime = i64;

/// Render a virtual instant for log output.
///
/// Values chrono cannot represent fall back to the raw millisecond count.
pub fn format_virtual_time(ms: VirtualTime) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => format!("{ms}ms"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch() {
        assert_eq!(format_virtual_time(0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn formats_millis() {
        assert_eq!(format_virtual_time(1_500), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn out_of_range_falls_back() {
        assert_eq!(format_virtual_time(i64::MAX), format!("{}ms", i64::MAX));
    }
}
