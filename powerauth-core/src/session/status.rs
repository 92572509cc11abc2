//! Decoding of the encrypted activation status blob.
//!
//! The server reports the authoritative activation state as a fixed-size
//! AES-CBC blob under the transport key. Unwrapping the transport key
//! requires the possession factor, so status decoding is gated on the
//! device-related key like every other transport-protected payload.
//!
//! # Binary Layout (32 bytes, decrypted)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       1     blob version (1)
//! 1       1     activation state (1..=5)
//! 2       4     current counter (u32 BE)
//! 6       1     failed attempt count
//! 7       1     maximum failed attempt count
//! 8       24    reserved
//! ```

use zeroize::Zeroizing;

use crate::crypto::symmetric::{decrypt_cbc_raw, ZERO_IV};
use crate::error::PowerAuthError;
use crate::signature::SignatureUnlockKeys;

use super::state::open_key;
use super::Session;

/// Size of the encrypted (and decrypted) status blob.
pub(crate) const STATUS_BLOB_SIZE: usize = 32;

/// Version byte of the status blob format.
pub(crate) const STATUS_BLOB_VERSION: u8 = 1;

/// Server-side activation state reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationServerState {
    /// The activation record exists but no device finished enrollment.
    Created = 1,
    /// The activation OTP was already consumed.
    OtpUsed = 2,
    /// The activation is live and signatures are accepted.
    Active = 3,
    /// The activation is blocked after too many failed attempts.
    Blocked = 4,
    /// The activation was removed on the server.
    Removed = 5,
}

impl ActivationServerState {
    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Created),
            2 => Some(Self::OtpUsed),
            3 => Some(Self::Active),
            4 => Some(Self::Blocked),
            5 => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Decoded activation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationStatus {
    /// Server-side activation state.
    pub state: ActivationServerState,
    /// Server-side signature counter.
    pub counter: u32,
    /// Failed authentication attempts so far.
    pub fail_count: u8,
    /// Attempt limit after which the server blocks the activation.
    pub max_fail_count: u8,
}

impl Session {
    /// Decrypts and decodes the status blob returned by the server.
    ///
    /// # Errors
    ///
    /// Returns the usual lifecycle errors when no committed activation
    /// exists, [`PowerAuthError::SignatureError`] when the possession
    /// unlock key is missing, and
    /// [`PowerAuthError::InvalidActivationData`] when the blob has the
    /// wrong size or fails its internal checks after decryption.
    pub fn decode_activation_status(
        &self,
        encrypted_blob: &[u8],
        unlock: &SignatureUnlockKeys,
    ) -> Result<ActivationStatus, PowerAuthError> {
        let eek = self.setup().external_encryption_key;
        let active = self.active_state()?;
        let possession = unlock
            .possession
            .ok_or_else(|| PowerAuthError::signature("possession unlock key not provided"))?;

        if encrypted_blob.len() != STATUS_BLOB_SIZE {
            return Err(PowerAuthError::activation_data(
                "status blob has unexpected size",
            ));
        }

        let transport_key = Zeroizing::new(open_key(
            &possession,
            eek.as_ref(),
            &active.transport_envelope,
        ));
        let blob = decrypt_cbc_raw(&transport_key, &ZERO_IV, encrypted_blob)?;

        if blob[0] != STATUS_BLOB_VERSION {
            return Err(PowerAuthError::activation_data(
                "unknown status blob version",
            ));
        }
        let state = ActivationServerState::from_byte(blob[1])
            .ok_or_else(|| PowerAuthError::activation_data("unknown activation state"))?;

        Ok(ActivationStatus {
            state,
            counter: u32::from_be_bytes([blob[2], blob[3], blob[4], blob[5]]),
            fail_count: blob[6],
            max_fail_count: blob[7],
        })
    }
}
