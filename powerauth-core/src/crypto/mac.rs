//! HMAC-SHA256 and the 16-byte truncation used by the signature protocol.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Computes HMAC-SHA256 over `data`.
///
/// # Panics
///
/// This function will not panic - HMAC accepts keys of any length.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Computes HMAC-SHA256 truncated to 16 bytes.
///
/// The HTTP signature value and envelope MACs use this truncated form.
#[must_use]
pub fn hmac_sha256_trunc16(key: &[u8], data: &[u8]) -> [u8; 16] {
    let full = hmac_sha256(key, data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}

/// Verifies a truncated MAC in constant time.
#[must_use]
pub fn verify_hmac_trunc16(key: &[u8], data: &[u8], expected: &[u8]) -> bool {
    if expected.len() != 16 {
        return false;
    }
    let computed = hmac_sha256_trunc16(key, data);
    computed.as_slice().ct_eq(expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_is_key_dependent() {
        let data = b"signed payload";
        let a = hmac_sha256(b"key-a", data);
        let b = hmac_sha256(b"key-b", data);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hmac_is_deterministic() {
        let a = hmac_sha256(b"key", b"data");
        let b = hmac_sha256(b"key", b"data");
        assert_eq!(a, b);
    }

    #[test]
    fn test_truncation_is_prefix() {
        let full = hmac_sha256(b"key", b"data");
        let trunc = hmac_sha256_trunc16(b"key", b"data");
        assert_eq!(&full[..16], &trunc);
    }

    #[test]
    fn test_verify_accepts_valid_mac() {
        let mac = hmac_sha256_trunc16(b"key", b"data");
        assert!(verify_hmac_trunc16(b"key", b"data", &mac));
    }

    #[test]
    fn test_verify_rejects_tampered_mac() {
        let mut mac = hmac_sha256_trunc16(b"key", b"data");
        mac[0] ^= 0x01;
        assert!(!verify_hmac_trunc16(b"key", b"data", &mac));
    }

    #[test]
    fn test_verify_rejects_wrong_length() {
        let mac = hmac_sha256(b"key", b"data");
        assert!(!verify_hmac_trunc16(b"key", b"data", &mac));
    }
}
