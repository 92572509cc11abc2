//! Activation code parsing and checksum validation.
//!
//! A user-entered activation code has the form `XXXXX-XXXXX-XXXXX-XXXXX`
//! where each group is five RFC 4648 base32 characters (no padding). The
//! last character of the fourth group is a Luhn-style check character over
//! the preceding nineteen. The first two groups form the short activation
//! identifier, the last two the activation OTP. A detached signature may
//! follow after `#` when the code was scanned from a signed QR payload.

use crate::error::PowerAuthError;

/// RFC 4648 base32 alphabet used by activation codes.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Number of dash-separated groups in a code.
const GROUP_COUNT: usize = 4;

/// Characters per group.
const GROUP_SIZE: usize = 5;

/// Total length of the code including dashes.
const CODE_LENGTH: usize = GROUP_COUNT * GROUP_SIZE + (GROUP_COUNT - 1);

/// A parsed and checksum-validated activation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationCode {
    /// Short activation identifier, `XXXXX-XXXXX` (first two groups).
    pub activation_id_short: String,
    /// Activation OTP, `XXXXX-XXXXX` (last two groups).
    pub activation_otp: String,
    /// Optional detached signature (base64 DER ECDSA), present after
    /// `#`. Activation step 1 verifies it against the master server key.
    pub activation_signature: Option<String>,
}

impl ActivationCode {
    /// Parses a user-entered activation code, validating the grammar and
    /// the check character.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationCode`] on any grammar
    /// or checksum violation.
    pub fn parse(input: &str) -> Result<Self, PowerAuthError> {
        let (code, signature) = match input.split_once('#') {
            Some((code, signature)) if !signature.is_empty() => (code, Some(signature)),
            Some(_) => return Err(PowerAuthError::InvalidActivationCode),
            None => (input, None),
        };

        if code.len() != CODE_LENGTH {
            return Err(PowerAuthError::InvalidActivationCode);
        }

        let bytes = code.as_bytes();
        let mut payload = [0u8; GROUP_COUNT * GROUP_SIZE];
        let mut count = 0;
        for (i, &b) in bytes.iter().enumerate() {
            if (i + 1) % (GROUP_SIZE + 1) == 0 {
                if b != b'-' {
                    return Err(PowerAuthError::InvalidActivationCode);
                }
            } else {
                if char_value(b).is_none() {
                    return Err(PowerAuthError::InvalidActivationCode);
                }
                payload[count] = b;
                count += 1;
            }
        }
        debug_assert_eq!(count, GROUP_COUNT * GROUP_SIZE);

        let data: [u8; 19] = payload[..19].try_into().expect("payload is 20 characters");
        if checksum_char(&data) != payload[19] {
            return Err(PowerAuthError::InvalidActivationCode);
        }

        Ok(Self {
            activation_id_short: code[..11].to_string(),
            activation_otp: code[12..].to_string(),
            activation_signature: signature.map(ToString::to_string),
        })
    }
}

/// Computes the check character for the 19 payload characters of a code.
///
/// Luhn-style mod-32 scheme: every second character counted from the
/// right is doubled (with a mod-31 reduction on overflow), the running
/// sum is seeded with the group count, and the check character encodes
/// the sum mod 32 in the code alphabet.
///
/// # Panics
///
/// Panics if any character is outside the code alphabet; callers
/// validate the alphabet first.
#[must_use]
pub fn checksum_char(data: &[u8; 19]) -> u8 {
    let mut sum = GROUP_COUNT as u32;
    for (i, &b) in data.iter().rev().enumerate() {
        let value = u32::from(char_value(b).expect("character is in the code alphabet"));
        let term = if i % 2 == 0 {
            let doubled = value * 2;
            if doubled >= 32 {
                doubled - 31
            } else {
                doubled
            }
        } else {
            value
        };
        sum += term;
    }
    CODE_ALPHABET[(sum % 32) as usize]
}

/// Maps a base32 character to its 5-bit value.
fn char_value(c: u8) -> Option<u8> {
    match c {
        b'A'..=b'Z' => Some(c - b'A'),
        b'2'..=b'7' => Some(c - b'2' + 26),
        _ => None,
    }
}
