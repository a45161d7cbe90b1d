use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("size value must not be empty")]
    Empty,
    #[error("invalid size suffix in '{0}', expected one of K, M, G")]
    BadSuffix(String),
    #[error("size value out of range: '{0}'")]
    OutOfRange(String),
}

/// Value written to a memory limit to lift it entirely.
pub const UNLIMITED: &str = "-1";

/// Parse a kernel-style byte size such as `1024`, `512K`, `10M` or `2G`.
///
/// `-1` denotes an unlimited value and maps to `u64::MAX`.
pub fn parse_byte_size(value: &str) -> Result<u64, UnitError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(UnitError::Empty);
    }
    if value == UNLIMITED {
        return Ok(u64::MAX);
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    if digits.is_empty() {
        return Err(UnitError::OutOfRange(value.to_owned()));
    }

    let multiplier: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1 << 10,
        "m" | "M" => 1 << 20,
        "g" | "G" => 1 << 30,
        _ => return Err(UnitError::BadSuffix(value.to_owned())),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| UnitError::OutOfRange(value.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_suffixed_sizes() {
        assert_eq!(parse_byte_size("200000").unwrap(), 200_000);
        assert_eq!(parse_byte_size("1K").unwrap(), 1024);
        assert_eq!(parse_byte_size("1M").unwrap(), 1_048_576);
        assert_eq!(parse_byte_size("10m").unwrap(), 10 * 1_048_576);
        assert_eq!(parse_byte_size("2G").unwrap(), 2 * 1_073_741_824);
        assert_eq!(parse_byte_size(" 3k ").unwrap(), 3072);
    }

    #[test]
    fn unlimited_is_largest() {
        assert_eq!(parse_byte_size("-1").unwrap(), u64::MAX);
        assert!(parse_byte_size("-1").unwrap() > parse_byte_size("100G").unwrap());
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse_byte_size(""), Err(UnitError::Empty));
        assert!(matches!(parse_byte_size("10T"), Err(UnitError::BadSuffix(_))));
        assert!(matches!(parse_byte_size("10MB"), Err(UnitError::BadSuffix(_))));
        assert!(matches!(parse_byte_size("M"), Err(UnitError::OutOfRange(_))));
        assert!(matches!(
            parse_byte_size("99999999999999999999G"),
            Err(UnitError::OutOfRange(_))
        ));
    }
}
