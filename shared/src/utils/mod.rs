//! Utility functions and helpers

pub mod time;

/// Convert bytes to a hexadecimal string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u64(s: &str) -> crate::Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| crate::Error::parameter(format!("invalid number {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        assert_eq!(bytes_to_hex(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("960").unwrap(), 960);
        assert_eq!(parse_u64("0x3C0").unwrap(), 960);
        assert_eq!(parse_u64(" 0Xff ").unwrap(), 255);
        assert!(parse_u64("0xzz").is_err());
    }
}
