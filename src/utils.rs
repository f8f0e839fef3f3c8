//! Utility functions for the archiver

use crate::error::{Result, RustArchiverError};

/// Tar record size; every archived file occupies whole records plus one header.
pub const TAR_RECORD: u64 = 512;

/// Format bytes in human-readable format (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    const THRESHOLD: u64 = 1024;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD as f64 && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD as f64;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration in human-readable format
pub fn format_duration(duration_secs: f64) -> String {
    if duration_secs < 60.0 {
        format!("{:.1}s", duration_secs)
    } else if duration_secs < 3600.0 {
        let minutes = (duration_secs / 60.0) as u32;
        let seconds = duration_secs % 60.0;
        format!("{}m {:.1}s", minutes, seconds)
    } else {
        let hours = (duration_secs / 3600.0) as u32;
        let minutes = ((duration_secs % 3600.0) / 60.0) as u32;
        format!("{}h {}m", hours, minutes)
    }
}

/// Parse a size such as `4096`, `10M`, `1.5G` or `2T` (binary multiples).
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(RustArchiverError::parse("empty size"));
    }
    let (number, mult) = match text.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_lowercase() {
                'k' => 10,
                'm' => 20,
                'g' => 30,
                't' => 40,
                'p' => 50,
                'e' => 60,
                _ => return Err(RustArchiverError::parse(format!("bad size suffix in '{}'", text))),
            };
            (&text[..i], 1u64 << shift)
        }
        _ => (text, 1u64),
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| RustArchiverError::parse(format!("invalid size '{}'", text)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(RustArchiverError::parse(format!("invalid size '{}'", text)));
    }
    let bytes = value * mult as f64;
    if bytes >= u64::MAX as f64 {
        return Err(RustArchiverError::parse(format!("size '{}' out of range", text)));
    }
    Ok(bytes as u64)
}

/// Space a file occupies in an archive: data rounded up to whole tar records plus a header.
pub fn archive_space(size: u64) -> u64 {
    let records = size.div_ceil(TAR_RECORD);
    records.saturating_mul(TAR_RECORD).saturating_add(TAR_RECORD)
}

/// Truncate string to specified length with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("10M").unwrap(), 10 << 20);
        assert_eq!(parse_size("1k").unwrap(), 1024);
        assert_eq!(parse_size("1.5G").unwrap(), 3 << 29);
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("-1M").is_err());
    }

    #[test]
    fn test_archive_space_includes_header() {
        assert_eq!(archive_space(0), 512);
        assert_eq!(archive_space(1), 1024);
        assert_eq!(archive_space(512), 1024);
        assert_eq!(archive_space(513), 1536);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(10 << 20), "10.00 MB");
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("abcdef", 10), "abcdef");
        assert_eq!(truncate_string("abcdefghij", 6), "abc...");
    }
}
