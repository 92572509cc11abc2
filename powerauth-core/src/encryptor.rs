//! Non-personalized request/response encryption for the custom
//! activation flow.
//!
//! Before any activation exists there is no shared key with the server,
//! so the custom enrollment payload travels in an ECIES-like envelope:
//! a fresh ephemeral P-256 key agrees with the master server public key,
//! the shared secret seeds a two-key tree (encryption, MAC), and the
//! payload is AES-CBC encrypted with an explicit nonce plus an HMAC over
//! the ciphertext. The same key pair protects the response.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::ecc::EcKeyPair;
use crate::crypto::kdf::derive_k;
use crate::crypto::mac::{hmac_sha256_trunc16, verify_hmac_trunc16};
use crate::crypto::symmetric::{decrypt_cbc_pkcs7, encrypt_cbc_pkcs7, KEY_SIZE};
use crate::crypto::random_16;
use crate::error::PowerAuthError;
use crate::util::{b64_decode, b64_decode_array, b64_encode};

/// Key-tree index of the envelope encryption key.
const ENVELOPE_INDEX_ENCRYPTION: u64 = 1;
/// Key-tree index of the envelope MAC key.
const ENVELOPE_INDEX_MAC: u64 = 2;

/// An encrypted request or response payload. All binary fields are
/// base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Client ephemeral public key, SEC1-compressed.
    pub ephemeral_public_key: String,
    /// IV of the encrypted data.
    pub nonce: String,
    /// AES-CBC ciphertext of the payload.
    pub encrypted_data: String,
    /// Truncated HMAC-SHA256 over the ciphertext.
    pub mac: String,
}

/// Request/response encryptor bound to one ephemeral key pair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NonPersonalizedEncryptor {
    ephemeral_public_key: Vec<u8>,
    encryption_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl NonPersonalizedEncryptor {
    /// Creates an encryptor against the master server public key.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::EncryptionFailed`] when the master key is
    /// malformed or the system RNG fails.
    pub fn new(master_server_public_key: &[u8]) -> Result<Self, PowerAuthError> {
        let ephemeral = EcKeyPair::generate().map_err(|_| PowerAuthError::EncryptionFailed)?;
        let base = ephemeral
            .shared_secret_reduced(master_server_public_key)
            .map_err(|_| PowerAuthError::EncryptionFailed)?;

        Ok(Self {
            ephemeral_public_key: ephemeral.public_key_bytes(),
            encryption_key: derive_k(&base, ENVELOPE_INDEX_ENCRYPTION),
            mac_key: derive_k(&base, ENVELOPE_INDEX_MAC),
        })
    }

    /// Encrypts a request payload.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::EncryptionFailed`] when the system RNG
    /// fails.
    pub fn encrypt_request(&self, data: &[u8]) -> Result<EncryptedEnvelope, PowerAuthError> {
        let nonce = random_16().map_err(|_| PowerAuthError::EncryptionFailed)?;
        let encrypted_data = encrypt_cbc_pkcs7(&self.encryption_key, &nonce, data);
        let mac = hmac_sha256_trunc16(&self.mac_key, &encrypted_data);

        Ok(EncryptedEnvelope {
            ephemeral_public_key: b64_encode(&self.ephemeral_public_key),
            nonce: b64_encode(&nonce),
            encrypted_data: b64_encode(&encrypted_data),
            mac: b64_encode(&mac),
        })
    }

    /// Verifies and decrypts a response payload produced with the same
    /// session keys.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::EncryptionFailed`] on a MAC mismatch or
    /// a failed decryption.
    pub fn decrypt_response(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, PowerAuthError> {
        let nonce: [u8; 16] = b64_decode_array(&envelope.nonce)
            .map_err(|_| PowerAuthError::EncryptionFailed)?;
        let encrypted_data =
            b64_decode(&envelope.encrypted_data).map_err(|_| PowerAuthError::EncryptionFailed)?;
        let mac = b64_decode(&envelope.mac).map_err(|_| PowerAuthError::EncryptionFailed)?;

        if !verify_hmac_trunc16(&self.mac_key, &encrypted_data, &mac) {
            return Err(PowerAuthError::EncryptionFailed);
        }
        decrypt_cbc_pkcs7(&self.encryption_key, &nonce, &encrypted_data)
            .map_err(|_| PowerAuthError::EncryptionFailed)
    }

    /// The ephemeral public key this encryptor announced, SEC1-compressed.
    #[must_use]
    pub fn ephemeral_public_key(&self) -> &[u8] {
        &self.ephemeral_public_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Server side of the envelope, reconstructed from the master secret
    /// key and the announced ephemeral public key.
    fn server_keys(master: &EcKeyPair, ephemeral_public: &[u8]) -> ([u8; 16], [u8; 16]) {
        let base = master.shared_secret_reduced(ephemeral_public).unwrap();
        (
            derive_k(&base, ENVELOPE_INDEX_ENCRYPTION),
            derive_k(&base, ENVELOPE_INDEX_MAC),
        )
    }

    #[test]
    fn test_server_can_open_request() {
        let master = EcKeyPair::generate().unwrap();
        let encryptor = NonPersonalizedEncryptor::new(&master.public_key_bytes()).unwrap();

        let envelope = encryptor.encrypt_request(b"custom activation payload").unwrap();
        let (enc_key, mac_key) = server_keys(&master, encryptor.ephemeral_public_key());

        let ciphertext = b64_decode(&envelope.encrypted_data).unwrap();
        let mac = b64_decode(&envelope.mac).unwrap();
        assert!(verify_hmac_trunc16(&mac_key, &ciphertext, &mac));

        let nonce: [u8; 16] = b64_decode(&envelope.nonce).unwrap().try_into().unwrap();
        let plaintext = decrypt_cbc_pkcs7(&enc_key, &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"custom activation payload");
    }

    #[test]
    fn test_response_roundtrip() {
        let master = EcKeyPair::generate().unwrap();
        let encryptor = NonPersonalizedEncryptor::new(&master.public_key_bytes()).unwrap();

        // The server answers under the same derived keys.
        let (enc_key, mac_key) = server_keys(&master, encryptor.ephemeral_public_key());
        let nonce = [0x24u8; 16];
        let ciphertext = encrypt_cbc_pkcs7(&enc_key, &nonce, b"server response");
        let response = EncryptedEnvelope {
            ephemeral_public_key: b64_encode(encryptor.ephemeral_public_key()),
            nonce: b64_encode(&nonce),
            encrypted_data: b64_encode(&ciphertext),
            mac: b64_encode(&hmac_sha256_trunc16(&mac_key, &ciphertext)),
        };

        assert_eq!(encryptor.decrypt_response(&response).unwrap(), b"server response");
    }

    #[test]
    fn test_tampered_response_is_rejected() {
        let master = EcKeyPair::generate().unwrap();
        let encryptor = NonPersonalizedEncryptor::new(&master.public_key_bytes()).unwrap();
        let mut envelope = encryptor.encrypt_request(b"payload").unwrap();

        let mut ciphertext = b64_decode(&envelope.encrypted_data).unwrap();
        ciphertext[0] ^= 0xFF;
        envelope.encrypted_data = b64_encode(&ciphertext);

        assert!(matches!(
            encryptor.decrypt_response(&envelope),
            Err(PowerAuthError::EncryptionFailed)
        ));
    }

    #[test]
    fn test_bad_master_key_is_rejected() {
        assert!(matches!(
            NonPersonalizedEncryptor::new(&[0xFFu8; 33]),
            Err(PowerAuthError::EncryptionFailed)
        ));
    }
}
