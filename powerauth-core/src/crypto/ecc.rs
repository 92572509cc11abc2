//! P-256 operations: key pairs, ECDH shared secrets and ECDSA signatures.
//!
//! Points travel SEC1-compressed (33 bytes) everywhere in the protocol;
//! ECDSA signatures travel DER-encoded, the form the server produces and
//! consumes. Shared secrets are the 32-byte X coordinate, reduced to an
//! AES key by taking the leftmost 16 bytes.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use zeroize::Zeroizing;

use crate::error::PowerAuthError;

use super::random_bytes;
use super::symmetric::KEY_SIZE;

/// Length of a SEC1-compressed P-256 point.
pub const COMPRESSED_POINT_SIZE: usize = 33;

/// Length of a P-256 scalar.
pub const SCALAR_SIZE: usize = 32;

/// A P-256 key pair. The secret scalar is zeroized on drop.
#[derive(Clone)]
pub struct EcKeyPair {
    secret: SecretKey,
}

impl EcKeyPair {
    /// Generates a fresh random key pair.
    ///
    /// # Errors
    ///
    /// Returns a [`PowerAuthError::SignatureError`] if the system RNG is
    /// unavailable.
    pub fn generate() -> Result<Self, PowerAuthError> {
        // Rejection-sample scalars; the miss probability is ~2^-32.
        loop {
            let mut candidate = Zeroizing::new([0u8; SCALAR_SIZE]);
            random_bytes(&mut *candidate)?;
            if let Ok(secret) = SecretKey::from_slice(&candidate[..]) {
                return Ok(Self { secret });
            }
        }
    }

    /// Restores a key pair from a 32-byte big-endian scalar.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationData`] when the bytes do
    /// not encode a valid non-zero scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, PowerAuthError> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|_| PowerAuthError::activation_data("invalid private key scalar"))?;
        Ok(Self { secret })
    }

    /// Returns the secret scalar as 32 big-endian bytes.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; SCALAR_SIZE]> {
        Zeroizing::new(self.secret.to_bytes().into())
    }

    /// Returns the public key as a SEC1-compressed point.
    #[must_use]
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// Computes the ECDH shared secret with a peer public key.
    ///
    /// Returns the 32-byte X coordinate of the shared point.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationData`] when the peer
    /// point does not decode.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, PowerAuthError> {
        let peer = decode_public_key(peer_public)?;
        let shared =
            p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }

    /// Computes the ECDH shared secret reduced to an AES-128 key.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationData`] when the peer
    /// point does not decode.
    pub fn shared_secret_reduced(
        &self,
        peer_public: &[u8],
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, PowerAuthError> {
        let full = self.shared_secret(peer_public)?;
        let mut out = Zeroizing::new([0u8; KEY_SIZE]);
        out.copy_from_slice(&full[..KEY_SIZE]);
        Ok(out)
    }

    /// Signs `data` with ECDSA-P256-SHA256, returning the DER-encoded
    /// signature.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signer = SigningKey::from(&self.secret);
        let signature: Signature = signer.sign(data);
        signature.to_der().as_bytes().to_vec()
    }
}

impl std::fmt::Debug for EcKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcKeyPair")
            .field("secret", &"[REDACTED]")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

/// Decodes a SEC1-encoded P-256 point.
///
/// # Errors
///
/// Returns [`PowerAuthError::InvalidActivationData`] when the bytes do
/// not encode a point on the curve.
pub fn decode_public_key(bytes: &[u8]) -> Result<PublicKey, PowerAuthError> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| PowerAuthError::activation_data("invalid P-256 public key"))
}

/// Checks that `bytes` encode a valid P-256 point.
///
/// # Errors
///
/// Returns [`PowerAuthError::InvalidActivationData`] when they do not.
pub fn validate_public_key(bytes: &[u8]) -> Result<(), PowerAuthError> {
    decode_public_key(bytes).map(|_| ())
}

/// Verifies a DER-encoded ECDSA-P256-SHA256 signature.
///
/// # Errors
///
/// Returns [`PowerAuthError::InvalidActivationData`] when the public key
/// or the signature is malformed, or when verification fails.
pub fn ecdsa_verify(
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), PowerAuthError> {
    let verifier = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| PowerAuthError::activation_data("invalid P-256 public key"))?;
    let signature = Signature::from_der(signature)
        .map_err(|_| PowerAuthError::activation_data("malformed ECDSA signature"))?;
    verifier
        .verify(data, &signature)
        .map_err(|_| PowerAuthError::activation_data("ECDSA verification failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_keys() {
        let a = EcKeyPair::generate().unwrap();
        let b = EcKeyPair::generate().unwrap();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn test_public_key_is_compressed() {
        let pair = EcKeyPair::generate().unwrap();
        let public = pair.public_key_bytes();
        assert_eq!(public.len(), COMPRESSED_POINT_SIZE);
        assert!(public[0] == 0x02 || public[0] == 0x03);
    }

    #[test]
    fn test_secret_roundtrip() {
        let pair = EcKeyPair::generate().unwrap();
        let restored = EcKeyPair::from_secret_bytes(pair.secret_bytes().as_ref()).unwrap();
        assert_eq!(pair.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_zero_scalar_is_rejected() {
        assert!(EcKeyPair::from_secret_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_ecdh_is_symmetric() {
        let alice = EcKeyPair::generate().unwrap();
        let bob = EcKeyPair::generate().unwrap();

        let ab = alice.shared_secret(&bob.public_key_bytes()).unwrap();
        let ba = bob.shared_secret(&alice.public_key_bytes()).unwrap();
        assert_eq!(ab.as_ref(), ba.as_ref());
    }

    #[test]
    fn test_reduced_secret_is_prefix() {
        let alice = EcKeyPair::generate().unwrap();
        let bob = EcKeyPair::generate().unwrap();

        let full = alice.shared_secret(&bob.public_key_bytes()).unwrap();
        let reduced = alice.shared_secret_reduced(&bob.public_key_bytes()).unwrap();
        assert_eq!(&full[..16], reduced.as_ref());
    }

    #[test]
    fn test_ecdsa_sign_verify_roundtrip() {
        let pair = EcKeyPair::generate().unwrap();
        let data = b"activation response payload";

        let signature = pair.sign(data);
        // DER SEQUENCE of two integers; at most 72 bytes for P-256.
        assert_eq!(signature[0], 0x30);
        assert!(signature.len() <= 72);
        ecdsa_verify(&pair.public_key_bytes(), data, &signature).unwrap();
    }

    #[test]
    fn test_ecdsa_rejects_tampered_data() {
        let pair = EcKeyPair::generate().unwrap();
        let signature = pair.sign(b"original");
        let result = ecdsa_verify(&pair.public_key_bytes(), b"tampered", &signature);
        assert!(matches!(
            result,
            Err(PowerAuthError::InvalidActivationData(_))
        ));
    }

    #[test]
    fn test_ecdsa_rejects_wrong_key() {
        let pair = EcKeyPair::generate().unwrap();
        let other = EcKeyPair::generate().unwrap();
        let signature = pair.sign(b"data");
        assert!(ecdsa_verify(&other.public_key_bytes(), b"data", &signature).is_err());
    }

    #[test]
    fn test_invalid_point_is_rejected() {
        assert!(validate_public_key(&[0xFFu8; 33]).is_err());
        assert!(validate_public_key(b"short").is_err());
    }
}
