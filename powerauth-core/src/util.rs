//! Small encoding helpers shared across the protocol modules.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::PowerAuthError;

/// Base64-encodes bytes with the standard alphabet and padding.
#[must_use]
pub(crate) fn b64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decodes standard base64, mapping failures to activation-data errors.
pub(crate) fn b64_decode(data: &str) -> Result<Vec<u8>, PowerAuthError> {
    STANDARD
        .decode(data)
        .map_err(|_| PowerAuthError::activation_data("invalid base64"))
}

/// Decodes base64 into a fixed-size array.
pub(crate) fn b64_decode_array<const N: usize>(data: &str) -> Result<[u8; N], PowerAuthError> {
    let bytes = b64_decode(data)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| PowerAuthError::activation_data("unexpected field length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_b64_roundtrip() {
        let data = b"\x00\x01\xFE\xFF";
        assert_eq!(b64_decode(&b64_encode(data)).unwrap(), data);
    }

    #[test]
    fn test_b64_rejects_garbage() {
        assert!(b64_decode("not base64 !!").is_err());
    }

    #[test]
    fn test_b64_array_length_check() {
        let encoded = b64_encode(&[0u8; 16]);
        assert!(b64_decode_array::<16>(&encoded).is_ok());
        assert!(b64_decode_array::<32>(&encoded).is_err());
    }
}
