//! Kubernetes resource-quantity parsing, restricted to the byte-size
//! suffixes a volume's ephemeral `size` field can carry (e.g. `"10Gi"`).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suffix {
    Byte,
    Kilobyte,
    Megabyte,
    Gigabyte,
    Terabyte,
    Petabyte,
    Exabyte,
    Kibibyte,
    Mebibyte,
    Gibibyte,
    Tebibyte,
    Pebibyte,
    Exbibyte,
}

impl Suffix {
    fn multiplier(self) -> f64 {
        match self {
            Suffix::Byte => 1.0,
            Suffix::Kilobyte => 1e3,
            Suffix::Megabyte => 1e6,
            Suffix::Gigabyte => 1e9,
            Suffix::Terabyte => 1e12,
            Suffix::Petabyte => 1e15,
            Suffix::Exabyte => 1e18,
            Suffix::Kibibyte => 2f64.powi(10),
            Suffix::Mebibyte => 2f64.powi(20),
            Suffix::Gibibyte => 2f64.powi(30),
            Suffix::Tebibyte => 2f64.powi(40),
            Suffix::Pebibyte => 2f64.powi(50),
            Suffix::Exbibyte => 2f64.powi(60),
        }
    }

    fn from_str(s: &str) -> Option<Suffix> {
        Some(match s {
            "" => Suffix::Byte,
            "k" | "K" => Suffix::Kilobyte,
            "M" => Suffix::Megabyte,
            "G" => Suffix::Gigabyte,
            "T" => Suffix::Terabyte,
            "P" => Suffix::Petabyte,
            "E" => Suffix::Exabyte,
            "Ki" => Suffix::Kibibyte,
            "Mi" => Suffix::Mebibyte,
            "Gi" => Suffix::Gibibyte,
            "Ti" => Suffix::Tebibyte,
            "Pi" => Suffix::Pebibyte,
            "Ei" => Suffix::Exbibyte,
            _ => return None,
        })
    }
}

#[derive(Debug)]
pub struct QuantityParseError(pub String);

impl fmt::Display for QuantityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quantity {:?}", self.0)
    }
}

impl std::error::Error for QuantityParseError {}

/// Parse a Kubernetes byte-size quantity string into a whole number of bytes.
pub fn parse_bytes(raw: &str) -> Result<i64, QuantityParseError> {
    let raw = raw.trim();
    let split_at = raw
        .rfind(|c: char| c.is_ascii_digit() || c == '.')
        .map(|i| i + 1)
        .unwrap_or(0);
    let (number, suffix) = raw.split_at(split_at);
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityParseError(raw.to_string()))?;
    let suffix = Suffix::from_str(suffix).ok_or_else(|| QuantityParseError(raw.to_string()))?;
    Ok((value * suffix.multiplier()).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gibibytes() {
        assert_eq!(parse_bytes("10Gi").unwrap(), 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_bytes("512").unwrap(), 512);
    }

    #[test]
    fn parses_decimal_gigabytes() {
        assert_eq!(parse_bytes("1G").unwrap(), 1_000_000_000);
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_bytes("10Qi").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("abc").is_err());
    }
}
