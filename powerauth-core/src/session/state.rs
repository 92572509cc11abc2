//! Internal activation state held by a [`Session`](super::Session).
//!
//! Exactly one discriminant holds at any time. Factor keys never rest in
//! cleartext: the active state stores one-block AES envelopes, each
//! wrapped by its unlock key (and by the external encryption key when the
//! setup carries one). Everything here is zeroized on drop.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::symmetric::{decrypt_block, encrypt_block, KEY_SIZE};

/// Tri-state activation lifecycle plus the terminal error discriminant.
///
/// Transitions: `Empty → Pending → Active`, `Active → Empty` on removal,
/// any state → `Broken` on cryptographic inconsistency. `Broken` is
/// terminal until an explicit reset.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub(crate) enum ActivationState {
    /// No activation exists.
    #[default]
    Empty,
    /// The handshake started; ephemeral material is held until commit.
    Pending(PendingActivation),
    /// A committed activation with wrapped signature keys.
    Active(ActiveState),
    /// A cryptographic inconsistency was detected; only reset recovers.
    Broken,
}

impl ActivationState {
    pub(crate) const fn tag(&self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Pending(_) => 1,
            Self::Active(_) => 2,
            Self::Broken => 3,
        }
    }
}

/// Handshake state between activation step 1 and commit.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct PendingActivation {
    /// Device private key scalar (big-endian).
    pub device_secret_key: [u8; 32],
    /// Device public key, SEC1-compressed.
    pub device_public_key: Vec<u8>,
    /// Client ephemeral private key scalar emitted in step 1.
    pub ephemeral_secret_key: [u8; 32],
    /// Short activation identifier, the PBKDF2 salt for this activation.
    pub activation_id_short: String,
    /// Activation OTP entered by the user or supplied by the custom flow.
    pub activation_otp: String,
    /// Master secret derived in step 2; `None` until the server response
    /// has been validated.
    pub master_secret: Option<[u8; 16]>,
    /// Activation identifier assigned by the server in step 2.
    pub activation_id: Option<String>,
    /// Server public key decrypted in step 2, SEC1-compressed.
    pub server_public_key: Option<Vec<u8>>,
}

/// Committed activation state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct ActiveState {
    /// Activation identifier assigned by the server.
    pub activation_id: String,
    /// Short activation identifier, retained as the knowledge-key salt.
    pub activation_id_short: String,
    /// Server public key, SEC1-compressed.
    pub server_public_key: Vec<u8>,
    /// Possession signature key wrapped by the possession unlock key.
    pub possession_envelope: [u8; KEY_SIZE],
    /// Knowledge signature key wrapped by the PBKDF2-derived unlock key.
    pub knowledge_envelope: [u8; KEY_SIZE],
    /// Biometry signature key envelope; present only when the factor was
    /// enrolled at commit or added later through a vault unlock.
    pub biometry_envelope: Option<[u8; KEY_SIZE]>,
    /// Transport key wrapped by the possession unlock key.
    pub transport_envelope: [u8; KEY_SIZE],
    /// Device private key encrypted with the vault encryption key
    /// (AES-CBC, PKCS#7, zero IV).
    pub device_private_key_envelope: Vec<u8>,
    /// Monotonic signature counter; never decreases.
    pub counter: u64,
}

impl ActiveState {
    /// Low-order byte of the counter.
    pub(crate) const fn counter_byte(&self) -> u8 {
        (self.counter & 0xFF) as u8
    }
}

/// Wraps a 16-byte key into its at-rest envelope.
///
/// One AES block under the unlock key, then one more under the external
/// encryption key when the setup carries one. No padding: a wrong unlock
/// key later yields a garbage key, never an error.
pub(crate) fn seal_key(
    unlock_key: &[u8; KEY_SIZE],
    external_key: Option<&[u8; KEY_SIZE]>,
    key: &[u8; KEY_SIZE],
) -> [u8; KEY_SIZE] {
    let inner = encrypt_block(unlock_key, key);
    match external_key {
        Some(eek) => encrypt_block(eek, &inner),
        None => inner,
    }
}

/// Unwraps an at-rest envelope back into the 16-byte key.
pub(crate) fn open_key(
    unlock_key: &[u8; KEY_SIZE],
    external_key: Option<&[u8; KEY_SIZE]>,
    envelope: &[u8; KEY_SIZE],
) -> [u8; KEY_SIZE] {
    let inner = match external_key {
        Some(eek) => decrypt_block(eek, envelope),
        None => *envelope,
    };
    decrypt_block(unlock_key, &inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let unlock = [0x11u8; 16];
        let key = [0x22u8; 16];

        let envelope = seal_key(&unlock, None, &key);
        assert_ne!(envelope, key);
        assert_eq!(open_key(&unlock, None, &envelope), key);
    }

    #[test]
    fn test_seal_open_with_external_key() {
        let unlock = [0x11u8; 16];
        let eek = [0x33u8; 16];
        let key = [0x22u8; 16];

        let envelope = seal_key(&unlock, Some(&eek), &key);
        assert_ne!(envelope, seal_key(&unlock, None, &key));
        assert_eq!(open_key(&unlock, Some(&eek), &envelope), key);
    }

    #[test]
    fn test_wrong_unlock_key_yields_garbage_not_error() {
        let unlock = [0x11u8; 16];
        let wrong = [0x12u8; 16];
        let key = [0x22u8; 16];

        let envelope = seal_key(&unlock, None, &key);
        let opened = open_key(&wrong, None, &envelope);
        assert_ne!(opened, key);
    }
}
