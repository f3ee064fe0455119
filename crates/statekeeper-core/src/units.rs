//! Byte-size parsing and formatting shared by validation, diffing and reports.

const KIB: u64 = 1024;

/// Parse a ZFS-style size (`2T`, `500G`, `1.5T`, `1024`, `none`) into bytes.
///
/// `none` and `0` map to `Some(0)`, which is how ZFS reports an unset quota.
/// Returns `None` when the value cannot be interpreted.
pub fn parse_size(raw: &str) -> Option<u64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if value.eq_ignore_ascii_case("none") || value == "-" {
        return Some(0);
    }
    if let Ok(bytes) = value.parse::<u64>() {
        return Some(bytes);
    }

    let upper = value.to_ascii_uppercase();
    let trimmed = upper
        .strip_suffix("IB")
        .or_else(|| upper.strip_suffix('B'))
        .unwrap_or(&upper);
    let (number, suffix) = trimmed.split_at(trimmed.len().saturating_sub(1));
    let multiplier = match suffix {
        "K" => KIB,
        "M" => KIB.pow(2),
        "G" => KIB.pow(3),
        "T" => KIB.pow(4),
        "P" => KIB.pow(5),
        _ => return None,
    };
    let amount: f64 = number.trim().parse().ok()?;
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }
    Some((amount * multiplier as f64) as u64)
}

/// Render a byte count the way `zfs list` does in messages, e.g. `1.5 TiB`.
pub fn humanise_bytes(bytes: u64) -> String {
    if bytes < KIB {
        return format!("{bytes} B");
    }
    let units = ['K', 'M', 'G', 'T', 'P', 'E'];
    let mut divisor = KIB;
    let mut exp = 0;
    let mut rest = bytes / KIB;
    while rest >= KIB && exp < units.len() - 1 {
        divisor *= KIB;
        rest /= KIB;
        exp += 1;
    }
    format!("{:.1} {}iB", bytes as f64 / divisor as f64, units[exp])
}
