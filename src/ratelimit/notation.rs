//! Compact period notation such as `"10s"`, `"5m"`, `"1h"` or `"7d"`.

use std::time::Duration;

use crate::error::{Result, SluiceError};

/// Parse `"<integer><unit>"` where unit is one of `s`, `m`, `h` or `d`.
pub fn parse_period(notation: &str) -> Result<Duration> {
    let invalid = || SluiceError::InvalidNotation(notation.to_string());

    let trimmed = notation.trim();
    let unit = trimmed.chars().last().ok_or_else(invalid)?;
    let number: u64 = trimmed[..trimmed.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;

    let seconds_per_unit = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        _ => return Err(invalid()),
    };

    number
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Render a duration back into the most compact notation that represents it
/// exactly, falling back to milliseconds for sub-second values.
pub fn format_period(period: Duration) -> String {
    let millis = period.as_millis();
    if millis % 1_000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = period.as_secs();
    if secs != 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs != 0 && secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_period("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_period("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_period("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_period("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_period(" 3s ").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_rejects_malformed_notation() {
        for bad in ["", "   ", "10x", "s", "abcs", "-1s", "1.5m", "10"] {
            let err = parse_period(bad).unwrap_err();
            assert!(
                matches!(err, SluiceError::InvalidNotation(_)),
                "expected notation error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_format_period() {
        assert_eq!(format_period(Duration::from_secs(10)), "10s");
        assert_eq!(format_period(Duration::from_secs(120)), "2m");
        assert_eq!(format_period(Duration::from_secs(3_600)), "1h");
        assert_eq!(format_period(Duration::from_secs(172_800)), "2d");
        assert_eq!(format_period(Duration::from_millis(400)), "400ms");
    }
}
