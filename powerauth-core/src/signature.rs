//! The HTTP signature engine: factor selection, factor-key unlock,
//! signature base string construction and the authorization header.
//!
//! Every signed request ratchets the session counter exactly once while
//! the session lock is held, before the request ever reaches the
//! transport. Two concurrent requests therefore always embed distinct,
//! strictly increasing counter values, and transport-level failure or
//! cancellation never rolls a counter back.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::kdf::{derive_password_key, normalize_unlock_key};
use crate::crypto::mac::hmac_sha256_trunc16;
use crate::crypto::{random_16, symmetric::KEY_SIZE};
use crate::error::PowerAuthError;
use crate::session::state::open_key;
use crate::session::Session;
use crate::util::b64_encode;

/// Name of the HTTP header carrying the PowerAuth signature.
pub const AUTHORIZATION_HEADER: &str = "X-PowerAuth-Authorization";

/// Protocol version token embedded in every header.
pub const PROTOCOL_VERSION: &str = "2.1";

/// Possession factor bit.
pub(crate) const FACTOR_POSSESSION: u16 = 0x0001;
/// Knowledge factor bit.
pub(crate) const FACTOR_KNOWLEDGE: u16 = 0x0002;
/// Biometry factor bit.
pub(crate) const FACTOR_BIOMETRY: u16 = 0x0004;
/// Flag ORed into the factor mask for vault-unlock signatures. It alters
/// the per-factor derivation salt so the server can tell a vault unlock
/// from a regular request; the header format is unchanged.
pub(crate) const FACTOR_PREPARE_VAULT_UNLOCK: u16 = 0x1000;

// =============================================================================
// Factor selection
// =============================================================================

/// The factor combinations a signature can be computed with.
///
/// "No factors" is unrepresentable; combinations the server does not
/// accept (knowledge together with biometry but without possession) are
/// likewise excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFactors {
    /// Possession only.
    Possession,
    /// Knowledge only.
    Knowledge,
    /// Biometry only.
    Biometry,
    /// Possession and knowledge (2FA).
    PossessionKnowledge,
    /// Possession and biometry (2FA).
    PossessionBiometry,
    /// All three factors (3FA).
    PossessionKnowledgeBiometry,
}

impl SignatureFactors {
    /// The wire bitmask for this combination.
    pub(crate) const fn bitmask(self) -> u16 {
        match self {
            Self::Possession => FACTOR_POSSESSION,
            Self::Knowledge => FACTOR_KNOWLEDGE,
            Self::Biometry => FACTOR_BIOMETRY,
            Self::PossessionKnowledge => FACTOR_POSSESSION | FACTOR_KNOWLEDGE,
            Self::PossessionBiometry => FACTOR_POSSESSION | FACTOR_BIOMETRY,
            Self::PossessionKnowledgeBiometry => {
                FACTOR_POSSESSION | FACTOR_KNOWLEDGE | FACTOR_BIOMETRY
            }
        }
    }

    /// The `pa_signature_type` token for this combination.
    #[must_use]
    pub const fn as_header_token(self) -> &'static str {
        match self {
            Self::Possession => "possession",
            Self::Knowledge => "knowledge",
            Self::Biometry => "biometry",
            Self::PossessionKnowledge => "possession_knowledge",
            Self::PossessionBiometry => "possession_biometry",
            Self::PossessionKnowledgeBiometry => "possession_knowledge_biometry",
        }
    }

    /// The individual factor bits in signing order (possession first,
    /// then knowledge, then biometry).
    pub(crate) fn ordered_factors(self) -> Vec<u16> {
        let mask = self.bitmask();
        [FACTOR_POSSESSION, FACTOR_KNOWLEDGE, FACTOR_BIOMETRY]
            .into_iter()
            .filter(|bit| mask & bit != 0)
            .collect()
    }

    pub(crate) const fn uses_possession(self) -> bool {
        self.bitmask() & FACTOR_POSSESSION != 0
    }

    pub(crate) const fn uses_knowledge(self) -> bool {
        self.bitmask() & FACTOR_KNOWLEDGE != 0
    }

    pub(crate) const fn uses_biometry(self) -> bool {
        self.bitmask() & FACTOR_BIOMETRY != 0
    }
}

// =============================================================================
// Caller intent
// =============================================================================

/// Caller intent for one signed operation: which factors to use and the
/// credentials that unlock them.
///
/// Constructors guarantee that every selected factor has its credential,
/// so a mismatch cannot reach the signing path.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PowerAuthAuthentication {
    #[zeroize(skip)]
    factors: SignatureFactors,
    password: Option<String>,
    biometry_key: Option<[u8; KEY_SIZE]>,
    possession_key_override: Option<[u8; KEY_SIZE]>,
}

impl PowerAuthAuthentication {
    /// Possession-only authentication.
    #[must_use]
    pub fn possession() -> Self {
        Self {
            factors: SignatureFactors::Possession,
            password: None,
            biometry_key: None,
            possession_key_override: None,
        }
    }

    /// Possession plus knowledge (the common 2FA shape).
    pub fn possession_with_password(password: impl Into<String>) -> Self {
        Self {
            factors: SignatureFactors::PossessionKnowledge,
            password: Some(password.into()),
            biometry_key: None,
            possession_key_override: None,
        }
    }

    /// Possession plus biometry.
    #[must_use]
    pub fn possession_with_biometry(biometry_key: [u8; KEY_SIZE]) -> Self {
        Self {
            factors: SignatureFactors::PossessionBiometry,
            password: None,
            biometry_key: Some(biometry_key),
            possession_key_override: None,
        }
    }

    /// All three factors.
    pub fn possession_password_biometry(
        password: impl Into<String>,
        biometry_key: [u8; KEY_SIZE],
    ) -> Self {
        Self {
            factors: SignatureFactors::PossessionKnowledgeBiometry,
            password: Some(password.into()),
            biometry_key: Some(biometry_key),
            possession_key_override: None,
        }
    }

    /// Knowledge-only authentication.
    pub fn knowledge(password: impl Into<String>) -> Self {
        Self {
            factors: SignatureFactors::Knowledge,
            password: Some(password.into()),
            biometry_key: None,
            possession_key_override: None,
        }
    }

    /// Biometry-only authentication.
    #[must_use]
    pub fn biometry(biometry_key: [u8; KEY_SIZE]) -> Self {
        Self {
            factors: SignatureFactors::Biometry,
            password: None,
            biometry_key: Some(biometry_key),
            possession_key_override: None,
        }
    }

    /// Overrides the possession unlock key, e.g. with one held by a
    /// hardware token instead of the default device-related key.
    #[must_use]
    pub fn with_possession_key(mut self, key: [u8; KEY_SIZE]) -> Self {
        self.possession_key_override = Some(key);
        self
    }

    /// The factor combination this intent selects.
    #[must_use]
    pub const fn factors(&self) -> SignatureFactors {
        self.factors
    }

    /// Builds the transient unlock-key triple, taking the default
    /// possession unlock key from the caller.
    pub(crate) fn unlock_keys(&self, default_possession: &[u8; KEY_SIZE]) -> SignatureUnlockKeys {
        SignatureUnlockKeys {
            possession: self
                .factors
                .uses_possession()
                .then(|| self.possession_key_override.unwrap_or(*default_possession)),
            biometry: self.biometry_key,
            knowledge: self.password.clone(),
        }
    }
}

/// Transient triple of unlock keys for one signed operation.
///
/// Never persisted; zeroized on drop. The knowledge entry carries the
/// plaintext password because its unlock key is salted by the activation
/// and can only be derived against a concrete session.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct SignatureUnlockKeys {
    /// Possession unlock key (SHA-256-folded device-related data).
    pub possession: Option<[u8; KEY_SIZE]>,
    /// Biometry unlock key (normalized platform-unwrapped key).
    pub biometry: Option<[u8; KEY_SIZE]>,
    /// Password for the knowledge factor.
    pub knowledge: Option<String>,
}

impl SignatureUnlockKeys {
    /// Creates the triple from its parts.
    #[must_use]
    pub fn new(
        possession: Option<[u8; KEY_SIZE]>,
        biometry: Option<[u8; KEY_SIZE]>,
        knowledge: Option<String>,
    ) -> Self {
        Self {
            possession,
            biometry,
            knowledge,
        }
    }

    /// A possession-only triple from raw device-related data.
    #[must_use]
    pub fn possession_only(device_related_data: &[u8]) -> Self {
        Self {
            possession: Some(normalize_unlock_key(device_related_data)),
            biometry: None,
            knowledge: None,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// A computed `X-PowerAuth-Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAuthorizationHeader {
    /// Header name, always [`AUTHORIZATION_HEADER`].
    pub key: &'static str,
    /// Header value, `PowerAuth pa_activation_id="…", …`.
    pub value: String,
}

impl HttpAuthorizationHeader {
    fn new(
        activation_id: &str,
        application_key: &str,
        nonce: &[u8; 16],
        factors: SignatureFactors,
        signature: &str,
    ) -> Self {
        let value = format!(
            "PowerAuth pa_activation_id=\"{}\", pa_application_key=\"{}\", \
             pa_nonce=\"{}\", pa_signature_type=\"{}\", pa_signature=\"{}\", \
             pa_version=\"{}\"",
            activation_id,
            application_key,
            b64_encode(nonce),
            factors.as_header_token(),
            signature,
            PROTOCOL_VERSION,
        );
        Self {
            key: AUTHORIZATION_HEADER,
            value,
        }
    }
}

// =============================================================================
// Signing
// =============================================================================

/// Builds the signature base string for one request.
///
/// `app_key & method & base64(uri_id) & base64(body) & base64(nonce)`.
/// For GET requests the body is the canonicalized query map.
#[must_use]
pub fn signature_base_string(
    application_key: &str,
    method: &str,
    uri_id: &str,
    body: &[u8],
    nonce: &[u8; 16],
) -> Vec<u8> {
    format!(
        "{}&{}&{}&{}&{}",
        application_key,
        method,
        b64_encode(uri_id.as_bytes()),
        b64_encode(body),
        b64_encode(nonce),
    )
    .into_bytes()
}

/// Formats 16 MAC bytes as the 8-decimal-digit signature component:
/// the trailing four bytes as a big-endian integer, masked to 31 bits,
/// mod 10^8, zero-padded.
#[must_use]
pub(crate) fn decimalize(mac: &[u8; 16]) -> String {
    let value = u32::from_be_bytes([mac[12], mac[13], mac[14], mac[15]]);
    format!("{:08}", (value & 0x7FFF_FFFF) % 100_000_000)
}

/// Computes the per-factor MAC input suffix: the 16-byte big-endian
/// counter followed by the two-byte factor salt. The salt carries the
/// factor bit and the vault-unlock flag, giving vault-unlock signatures
/// a distinct derivation without changing the header format.
fn factor_mac(key: &[u8; KEY_SIZE], base: &[u8], counter: u64, factor_bits: u16) -> [u8; 16] {
    let mut data = Vec::with_capacity(base.len() + 18);
    data.extend_from_slice(base);
    let mut counter_block = [0u8; 16];
    counter_block[8..].copy_from_slice(&counter.to_be_bytes());
    data.extend_from_slice(&counter_block);
    data.extend_from_slice(&factor_bits.to_be_bytes());
    hmac_sha256_trunc16(key, &data)
}

impl Session {
    /// Computes the authorization header for one HTTP request and
    /// ratchets the signature counter.
    ///
    /// The counter is incremented exactly once per call, before the MAC
    /// is computed; the first signature after commit embeds counter 1.
    /// Callers must persist the session afterwards — losing an increment
    /// across a restart permanently de-syncs the server.
    ///
    /// # Errors
    ///
    /// - [`PowerAuthError::MissingActivation`] with no activation,
    ///   [`PowerAuthError::ActivationPending`] before commit,
    ///   [`PowerAuthError::InvalidActivationState`] when broken.
    /// - [`PowerAuthError::SignatureError`] when a selected factor has no
    ///   unlock key or no enrolled envelope.
    pub fn sign_http_request(
        &mut self,
        body: &[u8],
        method: &str,
        uri_id: &str,
        unlock: &SignatureUnlockKeys,
        factors: SignatureFactors,
        vault_unlock: bool,
    ) -> Result<HttpAuthorizationHeader, PowerAuthError> {
        let application_key = self.setup().application_key.clone();
        let eek = self.setup().external_encryption_key;
        let factor_keys = self.unlock_factor_keys(unlock, factors, eek.as_ref())?;

        let nonce = random_16()?;
        let base = signature_base_string(&application_key, method, uri_id, body, &nonce);

        // Ratchet first: the value embedded in the MAC is the new counter,
        // and a later transport failure must not reuse it.
        let active = self.active_state_mut()?;
        active.counter += 1;
        let counter = active.counter;
        let activation_id = active.activation_id.clone();

        let vault_flag = if vault_unlock {
            FACTOR_PREPARE_VAULT_UNLOCK
        } else {
            0
        };
        let components: Vec<String> = factors
            .ordered_factors()
            .iter()
            .zip(factor_keys.iter())
            .map(|(&bit, key)| {
                let mac = factor_mac(key, &base, counter, bit | vault_flag);
                decimalize(&mac)
            })
            .collect();

        Ok(HttpAuthorizationHeader::new(
            &activation_id,
            &application_key,
            &nonce,
            factors,
            &components.join("-"),
        ))
    }

    /// Unlocks the signature keys for the selected factors, in signing
    /// order. The unlocked keys are transient and zeroized on drop.
    fn unlock_factor_keys(
        &self,
        unlock: &SignatureUnlockKeys,
        factors: SignatureFactors,
        eek: Option<&[u8; KEY_SIZE]>,
    ) -> Result<Vec<Zeroizing<[u8; KEY_SIZE]>>, PowerAuthError> {
        let active = self.active_state()?;
        let mut keys = Vec::with_capacity(3);

        if factors.uses_possession() {
            let unlock_key = unlock
                .possession
                .ok_or_else(|| PowerAuthError::signature("possession unlock key not provided"))?;
            keys.push(Zeroizing::new(open_key(
                &unlock_key,
                eek,
                &active.possession_envelope,
            )));
        }
        if factors.uses_knowledge() {
            let password = unlock
                .knowledge
                .as_deref()
                .ok_or_else(|| PowerAuthError::signature("password not provided"))?;
            let mut unlock_key = derive_password_key(password, &active.activation_id_short);
            keys.push(Zeroizing::new(open_key(
                &unlock_key,
                eek,
                &active.knowledge_envelope,
            )));
            unlock_key.zeroize();
        }
        if factors.uses_biometry() {
            let unlock_key = unlock
                .biometry
                .ok_or_else(|| PowerAuthError::signature("biometry unlock key not provided"))?;
            let envelope = active
                .biometry_envelope
                .as_ref()
                .ok_or_else(|| PowerAuthError::signature("biometry factor not enrolled"))?;
            keys.push(Zeroizing::new(open_key(&unlock_key, eek, envelope)));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_bitmasks() {
        assert_eq!(SignatureFactors::Possession.bitmask(), 1);
        assert_eq!(SignatureFactors::Knowledge.bitmask(), 2);
        assert_eq!(SignatureFactors::Biometry.bitmask(), 4);
        assert_eq!(SignatureFactors::PossessionKnowledge.bitmask(), 3);
        assert_eq!(SignatureFactors::PossessionKnowledgeBiometry.bitmask(), 7);
    }

    #[test]
    fn test_header_tokens() {
        assert_eq!(SignatureFactors::Possession.as_header_token(), "possession");
        assert_eq!(
            SignatureFactors::PossessionKnowledge.as_header_token(),
            "possession_knowledge"
        );
        assert_eq!(
            SignatureFactors::PossessionKnowledgeBiometry.as_header_token(),
            "possession_knowledge_biometry"
        );
    }

    #[test]
    fn test_ordered_factors_keep_signing_order() {
        assert_eq!(
            SignatureFactors::PossessionKnowledgeBiometry.ordered_factors(),
            vec![FACTOR_POSSESSION, FACTOR_KNOWLEDGE, FACTOR_BIOMETRY]
        );
        assert_eq!(
            SignatureFactors::PossessionBiometry.ordered_factors(),
            vec![FACTOR_POSSESSION, FACTOR_BIOMETRY]
        );
    }

    #[test]
    fn test_base_string_layout() {
        let nonce = [0u8; 16];
        let base = signature_base_string("KEY", "POST", "/pa/test", b"body", &nonce);
        let text = String::from_utf8(base).unwrap();
        let parts: Vec<&str> = text.split('&').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], "KEY");
        assert_eq!(parts[1], "POST");
        assert_eq!(parts[2], b64_encode(b"/pa/test"));
        assert_eq!(parts[3], b64_encode(b"body"));
    }

    #[test]
    fn test_decimalize_is_eight_digits() {
        let digits = decimalize(&[0xFFu8; 16]);
        assert_eq!(digits.len(), 8);
        assert!(digits.bytes().all(|b| b.is_ascii_digit()));

        // Zero MAC decimalizes to all zeros, zero-padded.
        assert_eq!(decimalize(&[0u8; 16]), "00000000");
    }

    #[test]
    fn test_authentication_builds_matching_unlock_keys() {
        let default_possession = [0x11u8; 16];
        let auth = PowerAuthAuthentication::possession_with_password("1234");
        let keys = auth.unlock_keys(&default_possession);
        assert_eq!(keys.possession, Some(default_possession));
        assert_eq!(keys.knowledge.as_deref(), Some("1234"));
        assert!(keys.biometry.is_none());
    }

    #[test]
    fn test_possession_key_override() {
        let default_possession = [0x11u8; 16];
        let hardware = [0x99u8; 16];
        let auth = PowerAuthAuthentication::possession().with_possession_key(hardware);
        let keys = auth.unlock_keys(&default_possession);
        assert_eq!(keys.possession, Some(hardware));
    }

    #[test]
    fn test_factor_salt_separates_vault_unlock() {
        let key = [0x42u8; 16];
        let base = b"application&POST&x&y&z";
        let regular = factor_mac(&key, base, 1, FACTOR_POSSESSION);
        let vault = factor_mac(&key, base, 1, FACTOR_POSSESSION | FACTOR_PREPARE_VAULT_UNLOCK);
        assert_ne!(regular, vault);
    }

    #[test]
    fn test_factor_mac_depends_on_counter() {
        let key = [0x42u8; 16];
        let base = b"application&POST&x&y&z";
        let one = factor_mac(&key, base, 1, FACTOR_POSSESSION);
        let two = factor_mac(&key, base, 2, FACTOR_POSSESSION);
        assert_ne!(one, two);
    }
}
