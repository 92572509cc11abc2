//! AES-128-CBC in the three shapes the protocol uses.
//!
//! Protocol messages carry their own randomness, so a zero IV is used
//! everywhere except where a message embeds an explicit nonce. Factor-key
//! envelopes and derived keys are exactly one block and are encrypted
//! raw (CBC over a single block with a zero IV degenerates to one ECB
//! block); variable-length payloads use PKCS#7.

use aes::cipher::{
    block_padding::{NoPadding, Pkcs7},
    generic_array::GenericArray,
    BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
};
use aes::Aes128;

use crate::error::PowerAuthError;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Symmetric key size in bytes. Every key in the protocol is AES-128.
pub const KEY_SIZE: usize = 16;

/// The all-zero IV used for envelope and key-tree encryption.
pub const ZERO_IV: [u8; 16] = [0u8; 16];

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Encrypts `plaintext` with AES-128-CBC and PKCS#7 padding.
#[must_use]
pub fn encrypt_cbc_pkcs7(key: &[u8; KEY_SIZE], iv: &[u8; BLOCK_SIZE], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts AES-128-CBC ciphertext and strips PKCS#7 padding.
///
/// # Errors
///
/// Returns [`PowerAuthError::InvalidActivationData`] when the ciphertext
/// is not block-aligned or the padding check fails (wrong key or
/// tampered data).
pub fn decrypt_cbc_pkcs7(
    key: &[u8; KEY_SIZE],
    iv: &[u8; BLOCK_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, PowerAuthError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(PowerAuthError::activation_data(
            "ciphertext is not block-aligned",
        ));
    }
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| PowerAuthError::activation_data("padding check failed"))
}

/// Encrypts block-aligned data with AES-128-CBC without padding.
///
/// # Errors
///
/// Returns [`PowerAuthError::SignatureError`] when `plaintext` is not a
/// multiple of the block size.
pub fn encrypt_cbc_raw(
    key: &[u8; KEY_SIZE],
    iv: &[u8; BLOCK_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, PowerAuthError> {
    if plaintext.is_empty() || plaintext.len() % BLOCK_SIZE != 0 {
        return Err(PowerAuthError::signature("plaintext is not block-aligned"));
    }
    Ok(Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

/// Decrypts block-aligned AES-128-CBC ciphertext without a padding check.
///
/// A wrong key yields garbage rather than an error; callers that need
/// integrity must verify a MAC or an internal cross-check themselves.
///
/// # Errors
///
/// Returns [`PowerAuthError::InvalidActivationData`] when the ciphertext
/// is not block-aligned.
pub fn decrypt_cbc_raw(
    key: &[u8; KEY_SIZE],
    iv: &[u8; BLOCK_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, PowerAuthError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(PowerAuthError::activation_data(
            "ciphertext is not block-aligned",
        ));
    }
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| PowerAuthError::activation_data("block decryption failed"))
}

/// Encrypts a single 16-byte block with a zero IV.
///
/// This is the envelope form: factor keys at rest are exactly one block
/// wrapped by their unlock key, and the key tree derives child keys by
/// encrypting an index block.
#[must_use]
pub fn encrypt_block(key: &[u8; KEY_SIZE], block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Decrypts a single 16-byte block with a zero IV.
///
/// The inverse of [`encrypt_block`]. There is no integrity check: a wrong
/// unlock key produces a garbage key, not an error.
#[must_use]
pub fn decrypt_block(key: &[u8; KEY_SIZE], block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut out);
    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbc_pkcs7_roundtrip() {
        let key = [0x42u8; 16];
        let iv = [0x11u8; 16];
        let plaintext = b"some data that is not block aligned";

        let ciphertext = encrypt_cbc_pkcs7(&key, &iv, plaintext);
        assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
        assert!(ciphertext.len() > plaintext.len());

        let decrypted = decrypt_cbc_pkcs7(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_cbc_pkcs7_wrong_key_fails() {
        let key = [0x42u8; 16];
        let wrong = [0x43u8; 16];
        let ciphertext = encrypt_cbc_pkcs7(&key, &ZERO_IV, b"payload bytes");

        // The padding check catches a wrong key with overwhelming probability.
        let result = decrypt_cbc_pkcs7(&wrong, &ZERO_IV, &ciphertext);
        assert!(matches!(
            result,
            Err(PowerAuthError::InvalidActivationData(_))
        ));
    }

    #[test]
    fn test_cbc_pkcs7_rejects_unaligned_input() {
        let key = [0u8; 16];
        let result = decrypt_cbc_pkcs7(&key, &ZERO_IV, &[0u8; 17]);
        assert!(matches!(
            result,
            Err(PowerAuthError::InvalidActivationData(_))
        ));
    }

    #[test]
    fn test_raw_block_roundtrip() {
        let key = [0x07u8; 16];
        let block = [0xA5u8; 16];

        let wrapped = encrypt_block(&key, &block);
        assert_ne!(wrapped, block);
        assert_eq!(decrypt_block(&key, &wrapped), block);
    }

    #[test]
    fn test_single_block_matches_cbc_zero_iv() {
        // CBC with a zero IV over exactly one block is the same transform
        // as a direct block encryption; the key tree relies on this.
        let key = [0x5Cu8; 16];
        let block = [0x36u8; 16];

        let direct = encrypt_block(&key, &block);
        let via_cbc = encrypt_cbc_raw(&key, &ZERO_IV, &block).unwrap();
        assert_eq!(via_cbc, direct);
    }

    #[test]
    fn test_raw_cbc_roundtrip_two_blocks() {
        let key = [0x99u8; 16];
        let iv = [0x01u8; 16];
        let plaintext = [0xEEu8; 32];

        let ciphertext = encrypt_cbc_raw(&key, &iv, &plaintext).unwrap();
        assert_eq!(ciphertext.len(), 32);
        let decrypted = decrypt_cbc_raw(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
