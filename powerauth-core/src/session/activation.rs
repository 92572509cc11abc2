//! The three-step activation handshake.
//!
//! Step 1 runs on the client and produces the enrollment request; step 2
//! validates the server response and derives the master secret; commit
//! wraps the derived factor keys with the unlock keys the user elected to
//! enroll and transitions the session to *Active*.
//!
//! A failed cryptographic check in step 2 is the one place where the
//! session self-resets to *Empty*; signature-time failures never touch
//! the state.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::ecc::{validate_public_key, EcKeyPair};
use crate::crypto::kdf::{
    derive_k, derive_password_key, KEY_INDEX_BIOMETRY, KEY_INDEX_KNOWLEDGE, KEY_INDEX_POSSESSION,
    KEY_INDEX_TRANSPORT, KEY_INDEX_VAULT,
};
use crate::crypto::mac::hmac_sha256;
use crate::crypto::random_16;
use crate::crypto::symmetric::{decrypt_cbc_pkcs7, encrypt_cbc_pkcs7, ZERO_IV};
use crate::error::PowerAuthError;
use crate::signature::SignatureUnlockKeys;
use crate::util::{b64_decode, b64_decode_array, b64_encode};

use super::state::{seal_key, ActivationState, ActiveState, PendingActivation};
use super::Session;

/// Inputs to activation step 1.
#[derive(Debug, Clone)]
pub struct ActivationStep1Param {
    /// Short activation identifier (first two code groups, or the base64
    /// of the canonicalized identity attributes in the custom flow).
    pub activation_id_short: String,
    /// Activation OTP (last two code groups, or a caller-supplied secret).
    pub activation_otp: String,
    /// Optional detached signature scanned with the code: a base64 DER
    /// ECDSA signature by the master server key over the full code
    /// string. Verified before any key material is generated.
    pub activation_signature: Option<String>,
}

impl From<crate::code::ActivationCode> for ActivationStep1Param {
    fn from(code: crate::code::ActivationCode) -> Self {
        Self {
            activation_id_short: code.activation_id_short,
            activation_otp: code.activation_otp,
            activation_signature: code.activation_signature,
        }
    }
}

/// Outputs of step 1, ready for the enrollment request body. All binary
/// fields are base64.
#[derive(Debug, Clone)]
pub struct ActivationStep1Result {
    /// 16 fresh random bytes, also the IV of the encrypted device key.
    pub activation_nonce: String,
    /// Device public key encrypted with the OTP expansion key.
    pub encrypted_device_public_key: String,
    /// HMAC proof that the client knows the application secret.
    pub application_signature: String,
    /// Client ephemeral public key, SEC1-compressed.
    pub ephemeral_public_key: String,
}

/// Server response fields consumed by step 2. All binary fields are
/// base64.
#[derive(Debug, Clone)]
pub struct ActivationStep2Param {
    /// Activation identifier assigned by the server.
    pub activation_id: String,
    /// Server nonce, the IV of the encrypted server public key.
    pub activation_nonce: String,
    /// Server ephemeral public key.
    pub ephemeral_public_key: String,
    /// Server public key encrypted with the ephemeral shared secret.
    pub encrypted_server_public_key: String,
    /// ECDSA signature by the master server key over the ephemeral key
    /// and the encrypted server key.
    pub encrypted_server_public_key_signature: String,
}

/// Outputs of step 2.
#[derive(Debug, Clone)]
pub struct ActivationStep2Result {
    /// Device public key fingerprint, eight decimal digits in two groups,
    /// shown to the user for out-of-band verification.
    pub activation_fingerprint: String,
}

impl Session {
    /// Runs activation step 1 and moves the session `Empty → Pending`.
    ///
    /// When the activation code carried a detached signature, it is
    /// verified against the master server public key first, so a forged
    /// code is rejected before the enrollment request is even built.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationState`] unless the
    /// session is *Empty*, [`PowerAuthError::InvalidActivationCode`] when
    /// the detached signature does not decode,
    /// [`PowerAuthError::InvalidActivationData`] when it does not verify,
    /// and [`PowerAuthError::SignatureError`] when the system RNG fails.
    pub fn start_activation(
        &mut self,
        param: &ActivationStep1Param,
    ) -> Result<ActivationStep1Result, PowerAuthError> {
        if !self.has_valid_setup() || !matches!(self.state(), ActivationState::Empty) {
            return Err(PowerAuthError::InvalidActivationState);
        }

        if let Some(signature) = &param.activation_signature {
            let signature =
                b64_decode(signature).map_err(|_| PowerAuthError::InvalidActivationCode)?;
            let signed_code =
                format!("{}-{}", param.activation_id_short, param.activation_otp);
            crate::crypto::ecc::ecdsa_verify(
                &self.setup().master_server_public_key,
                signed_code.as_bytes(),
                &signature,
            )?;
        }

        let device = EcKeyPair::generate()?;
        let ephemeral = EcKeyPair::generate()?;
        let nonce = random_16()?;
        let device_public_key = device.public_key_bytes();

        let mut expansion_key =
            derive_password_key(&param.activation_otp, &param.activation_id_short);
        let encrypted_device_public_key =
            encrypt_cbc_pkcs7(&expansion_key, &nonce, &device_public_key);
        expansion_key.zeroize();

        let signature_data = format!(
            "{}&{}&{}",
            param.activation_id_short,
            param.activation_otp,
            self.setup().application_key
        );
        let application_signature = hmac_sha256(
            self.setup().application_secret.as_bytes(),
            signature_data.as_bytes(),
        );

        let result = ActivationStep1Result {
            activation_nonce: b64_encode(&nonce),
            encrypted_device_public_key: b64_encode(&encrypted_device_public_key),
            application_signature: b64_encode(&application_signature),
            ephemeral_public_key: b64_encode(&ephemeral.public_key_bytes()),
        };

        self.replace_state(ActivationState::Pending(PendingActivation {
            device_secret_key: *device.secret_bytes(),
            device_public_key,
            ephemeral_secret_key: *ephemeral.secret_bytes(),
            activation_id_short: param.activation_id_short.clone(),
            activation_otp: param.activation_otp.clone(),
            master_secret: None,
            activation_id: None,
            server_public_key: None,
        }));

        log::debug!("activation step 1 complete, session is pending");
        Ok(result)
    }

    /// Validates the server response (step 2), deriving the master secret
    /// and the device fingerprint.
    ///
    /// On any cryptographic failure the pending handshake is discarded
    /// and the session returns to *Empty*.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationState`] unless a
    /// handshake is pending, or [`PowerAuthError::InvalidActivationData`]
    /// when a decode, ECDSA or decryption check fails.
    pub fn validate_activation_response(
        &mut self,
        param: &ActivationStep2Param,
    ) -> Result<ActivationStep2Result, PowerAuthError> {
        let result = self.validate_activation_response_inner(param);
        if matches!(result, Err(PowerAuthError::InvalidActivationData(_))) {
            log::debug!("activation step 2 failed, resetting to empty");
            self.replace_state(ActivationState::Empty);
        }
        result
    }

    fn validate_activation_response_inner(
        &mut self,
        param: &ActivationStep2Param,
    ) -> Result<ActivationStep2Result, PowerAuthError> {
        let master_server_public_key = self.setup().master_server_public_key.clone();
        let pending = self.pending_state_mut()?;

        let server_nonce: [u8; 16] = b64_decode_array(&param.activation_nonce)?;
        let server_ephemeral_public_key = b64_decode(&param.ephemeral_public_key)?;
        let encrypted_server_public_key = b64_decode(&param.encrypted_server_public_key)?;
        let signature = b64_decode(&param.encrypted_server_public_key_signature)?;

        // The master server key vouches for the ephemeral key and the
        // encrypted payload as one unit.
        let mut signed_data = Vec::with_capacity(
            server_ephemeral_public_key.len() + encrypted_server_public_key.len(),
        );
        signed_data.extend_from_slice(&server_ephemeral_public_key);
        signed_data.extend_from_slice(&encrypted_server_public_key);
        crate::crypto::ecc::ecdsa_verify(&master_server_public_key, &signed_data, &signature)?;

        let device = EcKeyPair::from_secret_bytes(&pending.device_secret_key)?;
        let ephemeral_shared = device.shared_secret_reduced(&server_ephemeral_public_key)?;
        let server_public_key =
            decrypt_cbc_pkcs7(&ephemeral_shared, &server_nonce, &encrypted_server_public_key)?;
        validate_public_key(&server_public_key)?;

        let master_secret = device.shared_secret_reduced(&server_public_key)?;

        let activation_fingerprint =
            device_fingerprint(&pending.device_public_key, &param.activation_id);

        pending.master_secret = Some(*master_secret);
        pending.activation_id = Some(param.activation_id.clone());
        pending.server_public_key = Some(server_public_key);

        log::debug!("activation step 2 validated");
        Ok(ActivationStep2Result {
            activation_fingerprint,
        })
    }

    /// Commits the activation (step 3): wraps each derived factor key
    /// with the unlock key the user elected to enroll and transitions
    /// `Pending → Active` with the counter at zero.
    ///
    /// Possession and knowledge are mandatory at commit; biometry is
    /// enrolled only when its unlock key is present. A factor skipped
    /// here can be added later solely through a vault unlock.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationState`] unless step 2
    /// completed, or when a mandatory unlock key is missing.
    pub fn complete_activation(
        &mut self,
        unlock: &SignatureUnlockKeys,
    ) -> Result<(), PowerAuthError> {
        let eek = self.setup().external_encryption_key;
        let pending = self.pending_state_mut()?;

        let master_secret = Zeroizing::new(
            pending
                .master_secret
                .ok_or(PowerAuthError::InvalidActivationState)?,
        );
        let activation_id = pending
            .activation_id
            .clone()
            .ok_or(PowerAuthError::InvalidActivationState)?;
        let server_public_key = pending
            .server_public_key
            .clone()
            .ok_or(PowerAuthError::InvalidActivationState)?;

        let possession_unlock = unlock
            .possession
            .ok_or(PowerAuthError::InvalidActivationState)?;
        let password = unlock
            .knowledge
            .as_deref()
            .ok_or(PowerAuthError::InvalidActivationState)?;
        let mut knowledge_unlock = derive_password_key(password, &pending.activation_id_short);

        let k_possession = Zeroizing::new(derive_k(&master_secret, KEY_INDEX_POSSESSION));
        let k_knowledge = Zeroizing::new(derive_k(&master_secret, KEY_INDEX_KNOWLEDGE));
        let k_biometry = Zeroizing::new(derive_k(&master_secret, KEY_INDEX_BIOMETRY));
        let k_transport = Zeroizing::new(derive_k(&master_secret, KEY_INDEX_TRANSPORT));
        let k_vault = Zeroizing::new(derive_k(&master_secret, KEY_INDEX_VAULT));

        let biometry_envelope = unlock
            .biometry
            .map(|biometry_unlock| seal_key(&biometry_unlock, eek.as_ref(), &k_biometry));

        // The vault key itself is never stored; it transiently wraps the
        // device private key and is rederived only by the server.
        let device_private_key_envelope =
            encrypt_cbc_pkcs7(&k_vault, &ZERO_IV, &pending.device_secret_key);

        let active = ActiveState {
            activation_id,
            activation_id_short: pending.activation_id_short.clone(),
            server_public_key,
            possession_envelope: seal_key(&possession_unlock, eek.as_ref(), &k_possession),
            knowledge_envelope: seal_key(&knowledge_unlock, eek.as_ref(), &k_knowledge),
            biometry_envelope,
            transport_envelope: seal_key(&possession_unlock, eek.as_ref(), &k_transport),
            device_private_key_envelope,
            counter: 0,
        };
        knowledge_unlock.zeroize();

        self.replace_state(ActivationState::Active(active));
        log::debug!("activation committed, session is active");
        Ok(())
    }
}

/// Computes the device public key fingerprint shown to the user:
/// `SHA-256(device_public_key || activation_id)` decimalized to eight
/// digits in two groups of four.
#[must_use]
pub(crate) fn device_fingerprint(device_public_key: &[u8], activation_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_public_key);
    hasher.update(activation_id.as_bytes());
    let hash = hasher.finalize();

    let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    let digits = (value & 0x7FFF_FFFF) % 100_000_000;
    format!("{:04}-{:04}", digits / 10_000, digits % 10_000)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{scalar, test_setup};
    use super::*;

    fn step1_param() -> ActivationStep1Param {
        ActivationStep1Param {
            activation_id_short: "AAAAA-AAAAA".to_string(),
            activation_otp: "AAAAA-AAAAE".to_string(),
            activation_signature: None,
        }
    }

    #[test]
    fn test_step1_moves_to_pending() {
        let mut session = Session::new(test_setup()).unwrap();
        let result = session.start_activation(&step1_param()).unwrap();

        assert!(session.has_pending_activation());
        assert_eq!(b64_decode(&result.activation_nonce).unwrap().len(), 16);
        // 33-byte compressed point, PKCS#7 padded to three blocks.
        assert_eq!(
            b64_decode(&result.encrypted_device_public_key).unwrap().len(),
            48
        );
        assert_eq!(b64_decode(&result.ephemeral_public_key).unwrap().len(), 33);
    }

    #[test]
    fn test_step1_verifies_detached_signature() {
        let mut session = Session::new(test_setup()).unwrap();
        // The test setup's master key pair signs the full code string.
        let master = EcKeyPair::from_secret_bytes(&scalar(2)).unwrap();
        let mut param = step1_param();
        param.activation_signature =
            Some(b64_encode(&master.sign(b"AAAAA-AAAAA-AAAAA-AAAAE")));

        session.start_activation(&param).unwrap();
        assert!(session.has_pending_activation());
    }

    #[test]
    fn test_step1_rejects_forged_detached_signature() {
        let mut session = Session::new(test_setup()).unwrap();
        let other = EcKeyPair::generate().unwrap();
        let mut param = step1_param();
        param.activation_signature =
            Some(b64_encode(&other.sign(b"AAAAA-AAAAA-AAAAA-AAAAE")));

        let result = session.start_activation(&param);
        assert!(matches!(
            result,
            Err(PowerAuthError::InvalidActivationData(_))
        ));
        assert!(!session.has_pending_activation());
    }

    #[test]
    fn test_step1_rejects_undecodable_detached_signature() {
        let mut session = Session::new(test_setup()).unwrap();
        let mut param = step1_param();
        param.activation_signature = Some("not base64 !!".to_string());

        let result = session.start_activation(&param);
        assert!(matches!(result, Err(PowerAuthError::InvalidActivationCode)));
        assert!(!session.has_pending_activation());
    }

    #[test]
    fn test_step1_rejects_pending_session() {
        let mut session = Session::new(test_setup()).unwrap();
        session.start_activation(&step1_param()).unwrap();
        assert!(matches!(
            session.start_activation(&step1_param()),
            Err(PowerAuthError::InvalidActivationState)
        ));
    }

    #[test]
    fn test_step2_without_step1_is_rejected() {
        let mut session = Session::new(test_setup()).unwrap();
        let param = ActivationStep2Param {
            activation_id: "act".to_string(),
            activation_nonce: b64_encode(&[0u8; 16]),
            ephemeral_public_key: b64_encode(&[0u8; 33]),
            encrypted_server_public_key: b64_encode(&[0u8; 48]),
            encrypted_server_public_key_signature: b64_encode(&[0u8; 64]),
        };
        assert!(matches!(
            session.validate_activation_response(&param),
            Err(PowerAuthError::InvalidActivationState)
        ));
    }

    #[test]
    fn test_step2_bad_signature_resets_to_empty() {
        let mut session = Session::new(test_setup()).unwrap();
        session.start_activation(&step1_param()).unwrap();

        let param = ActivationStep2Param {
            activation_id: "act".to_string(),
            activation_nonce: b64_encode(&[0u8; 16]),
            ephemeral_public_key: b64_encode(
                &EcKeyPair::generate().unwrap().public_key_bytes(),
            ),
            encrypted_server_public_key: b64_encode(&[0u8; 48]),
            encrypted_server_public_key_signature: b64_encode(&[0u8; 64]),
        };
        let result = session.validate_activation_response(&param);
        assert!(matches!(
            result,
            Err(PowerAuthError::InvalidActivationData(_))
        ));
        assert!(!session.has_pending_activation());
        assert!(!session.has_valid_activation());
    }

    #[test]
    fn test_commit_without_step2_is_rejected() {
        let mut session = Session::new(test_setup()).unwrap();
        session.start_activation(&step1_param()).unwrap();

        let unlock = SignatureUnlockKeys::new(
            Some([0x11u8; 16]),
            None,
            Some("1234".to_string()),
        );
        assert!(matches!(
            session.complete_activation(&unlock),
            Err(PowerAuthError::InvalidActivationState)
        ));
        // A failed commit leaves the handshake pending.
        assert!(session.has_pending_activation());
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = device_fingerprint(&[0x02u8; 33], "activation-id");
        assert_eq!(fingerprint.len(), 9);
        let (left, right) = fingerprint.split_once('-').unwrap();
        assert_eq!(left.len(), 4);
        assert_eq!(right.len(), 4);
        assert!(left.bytes().chain(right.bytes()).all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_fingerprint_binds_activation_id() {
        let key = [0x02u8; 33];
        assert_ne!(
            device_fingerprint(&key, "activation-a"),
            device_fingerprint(&key, "activation-b")
        );
    }
}
