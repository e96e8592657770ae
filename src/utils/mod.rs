const BYTE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Human readable byte count in binary units, e.g. `5.00 MB`. Anything past
/// terabytes stays in `TB`.
pub fn format_bytes(bytes: u64) -> String {
    let exponent = bytes
        .checked_ilog(1024)
        .unwrap_or(0)
        .min(BYTE_UNITS.len() as u32 - 1);
    let value = bytes as f64 / 1024f64.powi(exponent as i32);

    format!("{:.2} {}", value, BYTE_UNITS[exponent as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(u64::MAX), "16777216.00 TB");
    }
}
