//! Code signatures with `??` wildcard bytes.
//!
//! Record scans match whole serialized rows and never need wildcards; these
//! are for locating instructions inside the primary module.

use crate::error::{Error, Result};

pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        let value = u8::from_str_radix(token, 16)
            .map_err(|e| Error::Config(format!("Invalid signature token '{}': {}", token, e)))?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err(Error::Config("Signature pattern is empty".to_string()));
    }

    Ok(bytes)
}

/// Offsets of every position in `buffer` where `pattern` matches.
pub(crate) fn find_wildcard_matches(buffer: &[u8], pattern: &[Option<u8>]) -> Vec<usize> {
    if pattern.is_empty() || buffer.len() < pattern.len() {
        return Vec::new();
    }

    let last = buffer.len() - pattern.len();
    let mut results = Vec::new();

    'outer: for i in 0..=last {
        for (j, byte) in pattern.iter().enumerate() {
            if let Some(value) = byte
                && buffer[i + j] != *value
            {
                continue 'outer;
            }
        }
        results.push(i);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern_with_wildcards() {
        let bytes = parse_pattern("48 8B 05 ?? ?? ?? ?? 48 85 C0").unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[1], Some(0x8B));
        assert_eq!(bytes[3], None);
        assert_eq!(bytes[9], Some(0xC0));
    }

    #[test]
    fn test_parse_pattern_rejects_garbage() {
        assert!(matches!(parse_pattern("48 ZZ"), Err(Error::Config(_))));
        assert!(matches!(parse_pattern("   "), Err(Error::Config(_))));
    }

    #[test]
    fn test_wildcard_matches() {
        let buffer = [0x90, 0x48, 0x8B, 0x05, 0x11, 0x48, 0x8B, 0x05, 0x22];
        let pattern = parse_pattern("48 8B 05 ??").unwrap();
        assert_eq!(find_wildcard_matches(&buffer, &pattern), vec![1, 5]);
        assert!(find_wildcard_matches(&buffer[..3], &pattern).is_empty());
    }
}
