use chrono::{Local, TimeZone};

const UNITS: [&str; 5] = ["", "K", "M", "G", "T"];

/// Human size with binary multiples: `1536` is `"1.5KB"`, `500` is
/// `"500B"`, an exact `1024` steps up to `"1KB"`.
pub fn format_bytes(size: f64) -> String {
    let mut size = size;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    let number = format!("{size:.3}");
    let number = number.trim_end_matches('0').trim_end_matches('.');
    format!("{number}{}B", UNITS[unit])
}

/// Local time of `epoch` seconds rendered with `pattern`; empty if out of range.
pub fn format_epoch(epoch: f64, pattern: &str) -> String {
    let millis = (epoch * 1000.0) as i64;
    match Local.timestamp_millis_opt(millis).single() {
        Some(datetime) => datetime.format(pattern).to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_binary_units() {
        assert_eq!(format_bytes(1024.0 * 1.5), "1.5KB");
        assert_eq!(format_bytes(500.0), "500B");
        assert_eq!(format_bytes(1024f64.powi(3)), "1GB");
        assert_eq!(format_bytes(1024.0), "1KB");
        assert_eq!(format_bytes(1023.0), "1023B");
        assert_eq!(format_bytes(0.0), "0B");
        assert_eq!(format_bytes(1234567.0), "1.177MB");
    }

    #[test]
    fn stays_in_terabytes() {
        assert_eq!(format_bytes(1024f64.powi(5) * 2.0), "2048TB");
    }
}
