use std::time::Duration;

pub const TORRENT_EXTENSION: &str = "torrent";
pub const COMPLETE_PERCENT: u8 = 100;
pub const INFINITE_ETA: &str = "∞";

/// One tracked download, keyed by the uploaded file name.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStatus {
    pub name: String,
    pub progress: u8,
    pub download_speed: f64,
    pub size: u64,
}

impl TorrentStatus {
    /// Entry created on submission, before the agent has reported anything.
    pub fn optimistic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            progress: 0,
            download_speed: 0.0,
            size: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= COMPLETE_PERCENT
    }

    pub fn display_name(&self) -> &str {
        display_name(&self.name)
    }

    pub fn eta(&self) -> String {
        format_eta(self.size, self.download_speed)
    }
}

pub fn display_name(name: &str) -> &str {
    name.strip_suffix(".torrent").unwrap_or(name)
}

pub fn completion_message(name: &str) -> String {
    format!("{} downloaded!", display_name(name))
}

pub fn format_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    scaled(value as f64, &UNITS)
}

pub fn format_speed(value: f64) -> String {
    const UNITS: [&str; 5] = ["B/s", "KB/s", "MB/s", "GB/s", "TB/s"];
    scaled(value, &UNITS)
}

fn scaled(value: f64, units: &[&str]) -> String {
    if !value.is_finite() || value <= 0.0 {
        return format!("0 {}", units[0]);
    }
    let mut magnitude = value;
    let mut unit = 0;
    while magnitude >= 1024.0 && unit < units.len() - 1 {
        magnitude /= 1024.0;
        unit += 1;
    }
    format!("{} {}", trim_decimals(magnitude), units[unit])
}

// Two decimals at most, trailing zeros dropped: 1.50 -> "1.5", 1.00 -> "1".
fn trim_decimals(value: f64) -> String {
    let fixed = format!("{value:.2}");
    fixed.trim_end_matches('0').trim_end_matches('.').to_string()
}

pub fn format_progress(value: u8) -> String {
    format!("{}%", value.min(COMPLETE_PERCENT))
}

/// Breaks a duration into y/mo/w/d/h/m/s using fixed lengths (a month is
/// 30 days, a year 12 months). Leading zero components are dropped; once a
/// component is shown every smaller one is shown too.
pub fn format_duration(duration: Duration) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;
    const MONTH: u64 = 30 * DAY;
    const YEAR: u64 = 12 * MONTH;
    const UNITS: [(u64, &str); 6] = [
        (YEAR, "y"),
        (MONTH, "mo"),
        (WEEK, "w"),
        (DAY, "d"),
        (HOUR, "h"),
        (MINUTE, "m"),
    ];

    let mut remaining = duration.as_secs();
    let mut parts = Vec::new();
    for (length, suffix) in UNITS {
        let count = remaining / length;
        remaining %= length;
        if count > 0 || !parts.is_empty() {
            parts.push(format!("{count}{suffix}"));
        }
    }
    parts.push(format!("{remaining}s"));
    parts.join(" ")
}

pub fn format_eta(size: u64, download_speed: f64) -> String {
    if !download_speed.is_finite() || download_speed <= 0.0 {
        return INFINITE_ETA.to_string();
    }
    let seconds = size as f64 / download_speed;
    format_duration(Duration::from_secs(seconds.floor() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_boundaries() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1), "1 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10 MB");
        assert_eq!(format_bytes(1024_u64.pow(5)), "1024 TB");
    }

    #[test]
    fn bytes_round_to_two_decimals() {
        assert_eq!(format_bytes(1234), "1.21 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 7), "438.86 MB");
    }

    #[test]
    fn speed_boundaries() {
        assert_eq!(format_speed(0.0), "0 B/s");
        assert_eq!(format_speed(-5.0), "0 B/s");
        assert_eq!(format_speed(f64::NAN), "0 B/s");
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(1024.0), "1 KB/s");
        assert_eq!(format_speed(2.5 * 1024.0 * 1024.0), "2.5 MB/s");
    }

    #[test]
    fn duration_always_shows_seconds() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
    }

    #[test]
    fn duration_keeps_inner_zero_components() {
        assert_eq!(format_duration(Duration::from_secs(60)), "1m 0s");
        assert_eq!(format_duration(Duration::from_secs(3_605)), "1h 0m 5s");
        assert_eq!(format_duration(Duration::from_secs(86_400)), "1d 0h 0m 0s");
    }

    #[test]
    fn duration_uses_fixed_calendar() {
        let day = 86_400;
        assert_eq!(format_duration(Duration::from_secs(7 * day)), "1w 0d 0h 0m 0s");
        assert_eq!(
            format_duration(Duration::from_secs(30 * day)),
            "1mo 0w 0d 0h 0m 0s"
        );
        assert_eq!(
            format_duration(Duration::from_secs(360 * day + 1)),
            "1y 0mo 0w 0d 0h 0m 1s"
        );
    }

    #[test]
    fn eta_is_infinite_without_speed() {
        assert_eq!(format_eta(0, 0.0), INFINITE_ETA);
        assert_eq!(format_eta(u64::MAX, 0.0), INFINITE_ETA);
        assert_eq!(format_eta(10_240, 1024.0), "10s");
        assert_eq!(format_eta(10_000, 3.0), "55m 33s");
    }

    #[test]
    fn display_name_strips_only_trailing_suffix() {
        assert_eq!(display_name("x.torrent"), "x");
        assert_eq!(display_name("a.torrent.iso"), "a.torrent.iso");
        assert_eq!(display_name("plain"), "plain");
        assert_eq!(completion_message("ubuntu.torrent"), "ubuntu downloaded!");
    }

    #[test]
    fn completion_threshold() {
        let mut status = TorrentStatus::optimistic("x.torrent");
        assert!(!status.is_complete());
        status.progress = 99;
        assert!(!status.is_complete());
        status.progress = 100;
        assert!(status.is_complete());
        assert_eq!(format_progress(status.progress), "100%");
    }
}
