//! Canonicalization of string→string maps for data signing.
//!
//! GET request query parameters and custom-activation identity attributes
//! are folded into signed data as `k=v&k=v` with keys in lexicographic
//! order and both keys and values percent-encoded per RFC 3986.

use std::collections::BTreeMap;

/// Canonicalizes a key→value map into signable bytes.
///
/// Keys are emitted in lexicographic order (a `BTreeMap` guarantees the
/// iteration order), each key and value percent-encoded, pairs joined
/// with `&`. An empty map canonicalizes to empty bytes.
#[must_use]
pub fn signature_data_from_pairs(pairs: &BTreeMap<String, String>) -> Vec<u8> {
    let encoded: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect();
    encoded.join("&").into_bytes()
}

/// Percent-encodes a string per RFC 3986.
///
/// Unreserved characters (`A-Z a-z 0-9 - . _ ~`) pass through; every
/// other byte of the UTF-8 encoding becomes `%XX` with uppercase hex.
#[must_use]
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_empty_map_is_empty_bytes() {
        assert!(signature_data_from_pairs(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_keys_are_sorted() {
        let data = signature_data_from_pairs(&map(&[("b", "2"), ("a", "1"), ("c", "3")]));
        assert_eq!(data, b"a=1&b=2&c=3");
    }

    #[test]
    fn test_reserved_characters_are_encoded() {
        let data = signature_data_from_pairs(&map(&[("key one", "a&b=c")]));
        assert_eq!(data, b"key%20one=a%26b%3Dc");
    }

    #[test]
    fn test_unreserved_characters_pass_through() {
        assert_eq!(percent_encode("Az09-._~"), "Az09-._~");
    }

    #[test]
    fn test_utf8_is_encoded_per_byte() {
        // U+00E9 is 0xC3 0xA9 in UTF-8.
        assert_eq!(percent_encode("é"), "%C3%A9");
    }
}
