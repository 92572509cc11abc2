//! Cryptographic primitives shared with the PowerAuth server.
//!
//! All choices here are fixed by the protocol: AES-128-CBC with PKCS#7
//! padding, HMAC-SHA256 truncated to 16 bytes, ECDH and ECDSA on NIST
//! P-256, PBKDF2-HMAC-SHA256 for password normalization and a one-block
//! AES key tree for factor-key derivation.

pub mod canonical;
pub mod ecc;
pub mod kdf;
pub mod mac;
pub mod symmetric;

use crate::error::PowerAuthError;

/// Fills `buf` with bytes from the system random number generator.
///
/// # Errors
///
/// Returns a [`PowerAuthError::SignatureError`] if the system RNG is
/// unavailable.
pub fn random_bytes(buf: &mut [u8]) -> Result<(), PowerAuthError> {
    getrandom::getrandom(buf)
        .map_err(|e| PowerAuthError::signature(format!("system rng failed: {e}")))
}

/// Returns 16 fresh random bytes, suitable for a nonce or a new unlock key.
///
/// # Errors
///
/// Returns a [`PowerAuthError::SignatureError`] if the system RNG is
/// unavailable.
pub fn random_16() -> Result<[u8; 16], PowerAuthError> {
    let mut out = [0u8; 16];
    random_bytes(&mut out)?;
    Ok(out)
}
