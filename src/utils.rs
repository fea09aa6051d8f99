/// Utility functions for formatting values in logs and status lines
use time::macros::format_description;
use time::{OffsetDateTime, Time};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Format the device clock as HH:MM:SS
pub fn format_device_time(t: &Time) -> String {
    format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
}

/// Lowercase hex dump of a payload, as shown next to written values.
pub fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn format_temperature(celsius: f64) -> String {
    format!("{:.2} °C", celsius)
}

pub fn format_battery(volts: f64) -> String {
    format!("{:.2} V", volts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Date, Month};

    #[test]
    fn test_format_datetime() {
        let dt = Date::from_calendar_date(2024, Month::March, 7)
            .unwrap()
            .with_hms(9, 5, 3)
            .unwrap()
            .assume_utc();
        assert_eq!(format_datetime(&dt), "07.03.2024 - 09:05:03");
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x07]), "07");
        assert_eq!(hex(&[0x2C, 0x01]), "2c01");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn test_reading_formats() {
        assert_eq!(format_temperature(100.0 / 256.0), "0.39 °C");
        assert_eq!(format_battery(3.3), "3.30 V");
        assert_eq!(
            format_device_time(&Time::from_hms(7, 4, 9).unwrap()),
            "07:04:09"
        );
    }
}
