use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// 1 MiB; volume capacities are rounded up to this boundary.
pub(crate) const MIB: u64 = 1024 * 1024;

fn size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+)\s*([iA-Za-z]{1,3})?$").expect("valid size regex")
    })
}

/// Parse a size string such as "10GiB", "512 MB" or "4096" into bytes.
///
/// Decimal units (KB, MB, ...) are powers of 1000, binary units (KiB,
/// MiB, ...) powers of 1024. No unit means bytes. Zero is rejected.
pub(crate) fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim();
    let caps = size_regex()
        .captures(size_str)
        .ok_or_else(|| Error::validation(format!("invalid size '{size_str}'")))?;

    let number: u64 = caps[1]
        .parse()
        .map_err(|_| Error::validation(format!("invalid number in size '{size_str}'")))?;

    let multiplier: u64 = match caps.get(2).map(|m| m.as_str()) {
        None | Some("B") => 1,
        Some("KB") => 1000,
        Some("MB") => 1000_u64.pow(2),
        Some("GB") => 1000_u64.pow(3),
        Some("TB") => 1000_u64.pow(4),
        Some("PB") => 1000_u64.pow(5),
        Some("KiB") => 1024,
        Some("MiB") => 1024_u64.pow(2),
        Some("GiB") => 1024_u64.pow(3),
        Some("TiB") => 1024_u64.pow(4),
        Some("PiB") => 1024_u64.pow(5),
        Some(unit) => {
            return Err(Error::validation(format!(
                "unknown size unit '{unit}' in '{size_str}'"
            )))
        }
    };

    let bytes = number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::validation(format!("size '{size_str}' is too large")))?;
    if bytes == 0 {
        return Err(Error::validation(format!("size '{size_str}' must be positive")));
    }
    Ok(bytes)
}

/// Round `bytes` up to the next multiple of `align`, or `None` if that
/// does not fit in a `u64`.
pub(crate) fn align_up(bytes: u64, align: u64) -> Option<u64> {
    bytes.div_ceil(align).checked_mul(align)
}

/// Map a zero-based device index to its drive suffix: 0 → "a", 25 → "z",
/// 26 → "aa", 702 → "aaa".
pub(crate) fn index_to_drive_name(mut idx: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'a' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("12345").unwrap(), 12345);
        assert_eq!(parse_size("12345  B").unwrap(), 12345);
        assert_eq!(parse_size("12345B").unwrap(), 12345);
        assert_eq!(parse_size("12345KB").unwrap(), 12_345_000);
        assert_eq!(parse_size("12345KiB").unwrap(), 12_641_280);
        assert_eq!(parse_size("2GiB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1PB").unwrap(), 1_000_000_000_000_000);
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("10 XB").is_err());
        assert!(parse_size("-5GiB").is_err());
        assert!(parse_size("1.5GiB").is_err());
        assert!(parse_size("0").is_err());
        assert!(parse_size("99999999999PiB").is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, MIB), Some(MIB));
        assert_eq!(align_up(MIB, MIB), Some(MIB));
        assert_eq!(align_up(MIB + 1, MIB), Some(2 * MIB));
        // the last whole MiB below u64::MAX still fits, anything above does not
        let top = u64::MAX / MIB * MIB;
        assert_eq!(align_up(top, MIB), Some(top));
        assert_eq!(align_up(top + 1, MIB), None);
        assert_eq!(align_up(u64::MAX, MIB), None);
    }

    #[test]
    fn test_index_to_drive_name() {
        assert_eq!(index_to_drive_name(0), "a");
        assert_eq!(index_to_drive_name(1), "b");
        assert_eq!(index_to_drive_name(25), "z");
        assert_eq!(index_to_drive_name(26), "aa");
        assert_eq!(index_to_drive_name(702), "aaa");
        assert_eq!(index_to_drive_name(1403), "baz");
        assert_eq!(index_to_drive_name(18277), "zzz");
    }
}
