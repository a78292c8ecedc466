//! Timestamp helpers used in manifests, reports and logs.

use chrono::{DateTime, Local, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Format of run timestamps: `2024-05-01_13-45-09`.
pub const RUN_TS_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Returns the current local time as a run timestamp.
///
/// # Examples
///
/// ```
/// use slidepipe::utils::now_ts;
///
/// let ts = now_ts();
/// assert_eq!(ts.len(), 19);
/// assert_eq!(&ts[10..11], "_");
/// ```
#[must_use]
pub fn now_ts() -> String {
    Local::now().format(RUN_TS_FORMAT).to_string()
}

/// Returns the current UTC time as an ISO 8601 formatted string:
/// `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`.
#[must_use]
pub fn iso_timestamp() -> String {
    format_iso(&Utc::now())
}

/// Formats a timestamp the way [`iso_timestamp`] does.
#[must_use]
pub fn format_iso(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Renders a duration for humans: `12.34s`, `3m 5.2s`, `2h 7m`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn human_time(seconds: f64) -> String {
    let s = seconds.max(0.0);
    if s < 60.0 {
        return format!("{s:.2}s");
    }
    let minutes = (s / 60.0).floor();
    let rest = s - minutes * 60.0;
    if minutes < 60.0 {
        return format!("{}m {rest:.1}s", minutes as u64);
    }
    let hours = (minutes / 60.0).floor();
    format!("{}h {}m", hours as u64, (minutes - hours * 60.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_human_time() {
        assert_eq!(human_time(0.5), "0.50s");
        assert_eq!(human_time(59.994), "59.99s");
        assert_eq!(human_time(185.3), "3m 5.3s");
        assert_eq!(human_time(7_500.0), "2h 5m");
    }

    #[test]
    fn test_now_ts_shape() {
        let ts = now_ts();
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, RUN_TS_FORMAT).is_ok());
    }

    #[test]
    fn test_format_iso() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_iso(&ts), "2024-03-09T07:05:01.000000+00:00");
    }
}
