//! Operations gated by the server-released vault encryption key.
//!
//! The vault key is never stored on the client. Privileged operations
//! first obtain `encrypted_vault_encryption_key` from a signed
//! `/pa/vault/unlock` request; the routines here decrypt it under the
//! transport key, use it once and let it zeroize.

use zeroize::Zeroizing;

use crate::crypto::ecc::EcKeyPair;
use crate::crypto::kdf::{derive_k, KEY_INDEX_BIOMETRY};
use crate::crypto::symmetric::{decrypt_block, decrypt_cbc_pkcs7, KEY_SIZE, ZERO_IV};
use crate::error::PowerAuthError;
use crate::session::state::{open_key, seal_key};
use crate::session::Session;
use crate::signature::SignatureUnlockKeys;

impl Session {
    /// Decrypts the one-shot vault encryption key released by the server.
    ///
    /// `AES(K_transport, zero IV, K_vault)` — a single block under the
    /// transport key, which in turn is unwrapped with the possession
    /// factor.
    fn unwrap_vault_key(
        &self,
        encrypted_vault_key: &[u8],
        unlock: &SignatureUnlockKeys,
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, PowerAuthError> {
        let eek = self.setup().external_encryption_key;
        let active = self.active_state()?;
        let possession = unlock
            .possession
            .ok_or_else(|| PowerAuthError::signature("possession unlock key not provided"))?;

        let envelope: [u8; KEY_SIZE] = encrypted_vault_key
            .try_into()
            .map_err(|_| PowerAuthError::activation_data("vault key has unexpected size"))?;

        let transport_key = Zeroizing::new(open_key(
            &possession,
            eek.as_ref(),
            &active.transport_envelope,
        ));
        Ok(Zeroizing::new(decrypt_block(&transport_key, &envelope)))
    }

    /// Signs `data` with the device private key using ECDSA-P256-SHA256.
    ///
    /// The private key envelope stored at commit time is decrypted with
    /// the vault key; a wrong vault key fails the padding or scalar check.
    ///
    /// # Errors
    ///
    /// Lifecycle errors when no committed activation exists,
    /// [`PowerAuthError::SignatureError`] for a missing possession unlock
    /// key, [`PowerAuthError::InvalidActivationData`] when the envelope
    /// does not open.
    pub fn sign_data_with_device_private_key(
        &self,
        encrypted_vault_key: &[u8],
        unlock: &SignatureUnlockKeys,
        data: &[u8],
    ) -> Result<Vec<u8>, PowerAuthError> {
        let vault_key = self.unwrap_vault_key(encrypted_vault_key, unlock)?;
        let active = self.active_state()?;

        let secret = Zeroizing::new(decrypt_cbc_pkcs7(
            &vault_key,
            &ZERO_IV,
            &active.device_private_key_envelope,
        )?);
        let device = EcKeyPair::from_secret_bytes(&secret)?;
        Ok(device.sign(data))
    }

    /// Derives the custom encryption key at `index` from the vault key.
    ///
    /// # Errors
    ///
    /// Same conditions as
    /// [`sign_data_with_device_private_key`](Self::sign_data_with_device_private_key).
    pub fn derive_cryptographic_key_from_vault_key(
        &self,
        encrypted_vault_key: &[u8],
        unlock: &SignatureUnlockKeys,
        index: u64,
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, PowerAuthError> {
        let vault_key = self.unwrap_vault_key(encrypted_vault_key, unlock)?;
        Ok(Zeroizing::new(derive_k(&vault_key, index)))
    }

    /// Enrolls the biometry factor after activation.
    ///
    /// The biometry signature key is rederived from the vault key
    /// (`derive_k(K_vault, 3)`, the same child the server knows) and
    /// wrapped with the new biometry unlock key.
    ///
    /// # Errors
    ///
    /// Lifecycle errors when no committed activation exists, and
    /// [`PowerAuthError::SignatureError`] when the possession or biometry
    /// unlock key is missing.
    pub fn add_biometry_factor(
        &mut self,
        encrypted_vault_key: &[u8],
        unlock: &SignatureUnlockKeys,
    ) -> Result<(), PowerAuthError> {
        let vault_key = self.unwrap_vault_key(encrypted_vault_key, unlock)?;
        let biometry_unlock = unlock
            .biometry
            .ok_or_else(|| PowerAuthError::signature("biometry unlock key not provided"))?;
        let eek = self.setup().external_encryption_key;

        let biometry_key = Zeroizing::new(derive_k(&vault_key, KEY_INDEX_BIOMETRY));
        let envelope = seal_key(&biometry_unlock, eek.as_ref(), &biometry_key);

        let active = self.active_state_mut()?;
        active.biometry_envelope = Some(envelope);
        Ok(())
    }
}
