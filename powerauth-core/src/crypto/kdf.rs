//! Key derivation: the one-block AES key tree, PBKDF2 password
//! normalization and the SHA-256 unlock-key folding.

use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use super::symmetric::{encrypt_block, KEY_SIZE};

/// PBKDF2 iteration count fixed by the protocol.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Key-tree index of the possession signature key.
pub const KEY_INDEX_POSSESSION: u64 = 1;
/// Key-tree index of the knowledge signature key.
pub const KEY_INDEX_KNOWLEDGE: u64 = 2;
/// Key-tree index of the biometry signature key.
pub const KEY_INDEX_BIOMETRY: u64 = 3;
/// Key-tree index of the transport key.
pub const KEY_INDEX_TRANSPORT: u64 = 1000;
/// Key-tree index of the vault encryption key.
pub const KEY_INDEX_VAULT: u64 = 2000;

/// Derives a child key from `master` at `index`.
///
/// The key tree encrypts the 16-byte big-endian index with the master key
/// (AES-CBC, zero IV, exactly one block). The four signature factor keys,
/// the transport key and the vault key are all children of the master
/// secret established during activation; custom encryption keys are
/// children of the vault key.
#[must_use]
pub fn derive_k(master: &[u8; KEY_SIZE], index: u64) -> [u8; KEY_SIZE] {
    let mut block = [0u8; 16];
    block[8..].copy_from_slice(&index.to_be_bytes());
    encrypt_block(master, &block)
}

/// Normalizes a password-class secret into a 16-byte AES key.
///
/// `PBKDF2-HMAC-SHA256(secret, salt = activation_id_short, 10000)`.
/// Used both for the knowledge unlock key and for the OTP expansion key
/// of activation step 1. The salt binds the derived key to one
/// activation, so the same PIN on two activations yields unrelated
/// unlock keys.
#[must_use]
pub fn derive_password_key(password: &str, activation_id_short: &str) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        activation_id_short.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut out,
    );
    out
}

/// Folds arbitrary device-related entropy into a 16-byte unlock key.
///
/// SHA-256 truncated to 16 bytes. Used for the possession unlock key
/// (from a device identifier) and for normalizing the platform-wrapped
/// biometry key.
#[must_use]
pub fn normalize_unlock_key(data: &[u8]) -> [u8; KEY_SIZE] {
    let hash = Sha256::digest(data);
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&hash[..KEY_SIZE]);
    out
}
