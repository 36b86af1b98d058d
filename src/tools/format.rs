/// Render a byte count in human readable form ("2.50 MiB").
pub fn human_bytes(count: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if count < 1024 {
        return format!("{} B", count);
    }

    let mut value = count as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Byte count for display: raw when `exact`, humanized otherwise.
pub fn display_bytes(count: u64, exact: bool) -> String {
    if exact {
        count.to_string()
    } else {
        human_bytes(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_counts_stay_exact() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
    }

    #[test]
    fn larger_counts_scale() {
        assert_eq!(human_bytes(1024), "1.00 KiB");
        assert_eq!(human_bytes(10 * 1024 * 1024), "10.00 MiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.00 GiB");
    }

    #[test]
    fn display_respects_exact() {
        assert_eq!(display_bytes(2048, true), "2048");
        assert_eq!(display_bytes(2048, false), "2.00 KiB");
    }
}
