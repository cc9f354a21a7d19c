//! Byte formatting helpers used by logs and the `list` command

use num_format::{Locale, ToFormattedString};

/// Convert bytes to human-readable format (e.g., "1.50 GB")
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    let mut steps = 0;
    let mut val: f64 = *bytes as f64;

    while val > 1024. && steps <= 8 {
        val /= 1024.;
        steps += 1;
    }

    let unit = match steps {
        0 => "B",
        1 => "KB",
        2 => "MB",
        3 => "GB",
        4 => "TB",
        5 => "PB",
        6 => "EB",
        7 => "ZB",
        8 => "YB",
        _ => "Not Supported",
    };

    if add_bytes {
        let bytes_str = bytes.to_formatted_string(&Locale::en);
        format!("{:.2} {} ({} bytes)", val, unit, bytes_str)
    } else {
        format!("{:.2} {}", val, unit)
    }
}

/// Same as [`bytes_to_pretty`] for the signed counters on a partition record,
/// where a negative value means "unknown".
pub fn signed_bytes_to_pretty(bytes: i64) -> String {
    match u64::try_from(bytes) {
        Ok(value) => bytes_to_pretty(&value, false),
        Err(_) => "unknown".to_string(),
    }
}
