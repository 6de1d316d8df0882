//! Configuration and small shared helpers.

/// Environment-based configuration.
pub mod config;

use std::time::Duration;

/// Format a duration the way progress messages show it: `45s` or `3m 20s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    if total < 60 {
        return format!("{total}s");
    }
    format!("{}m {}s", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m 0s");
        assert_eq!(format_duration(Duration::from_secs(200)), "3m 20s");
    }
}
