//! Versioned binary serialization of the activation state.
//!
//! # Binary Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     magic ("PWAS")
//! 4       1     format version (u8)
//! 5       4     payload_len (u32 LE)
//! 9       N     payload (state tag + state fields)
//! 9+N     4     crc32 (LE, over bytes 0..9+N)
//! ```
//!
//! Variable-length fields inside the payload are length-prefixed with a
//! u16 LE. Readers tolerate unknown bytes after the CRC (forward compat)
//! but reject tampering anywhere inside the covered region, and mark the
//! session *Broken* when a well-formed blob declares an unknown version.

use crate::crypto::ecc::validate_public_key;
use crate::error::PowerAuthError;

use super::state::{ActivationState, ActiveState, PendingActivation};
use super::Session;

/// Magic bytes at the start of every serialized session blob.
const STATE_MAGIC: &[u8; 4] = b"PWAS";

/// Current serialization format version.
const STATE_VERSION: u8 = 1;

/// Fixed header size: magic + version + payload length.
const HEADER_SIZE: usize = 9;

impl Session {
    /// Serializes the current activation state into a versioned blob.
    #[must_use]
    pub fn serialize_state(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(256);
        payload.push(self.state().tag());
        match self.state() {
            ActivationState::Empty | ActivationState::Broken => {}
            ActivationState::Pending(pending) => write_pending(&mut payload, pending),
            ActivationState::Active(active) => write_active(&mut payload, active),
        }

        let mut blob = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
        blob.extend_from_slice(STATE_MAGIC);
        blob.push(STATE_VERSION);
        blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        blob.extend_from_slice(&payload);

        let crc = crc32fast::hash(&blob);
        blob.extend_from_slice(&crc.to_le_bytes());
        blob
    }

    /// Replaces the activation state from a serialized blob.
    ///
    /// The replacement is atomic: on any error the current state is left
    /// untouched, with one deliberate exception — a blob that passes the
    /// integrity check but declares an unknown version marks the session
    /// *Broken*, since its content cannot be interpreted safely.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationData`] on truncation,
    /// magic or CRC mismatch, unknown version, or a violated internal
    /// cross-check.
    pub fn deserialize_state(&mut self, blob: &[u8]) -> Result<(), PowerAuthError> {
        if blob.len() < HEADER_SIZE + 4 {
            return Err(PowerAuthError::activation_data("state blob truncated"));
        }
        if &blob[..4] != STATE_MAGIC {
            return Err(PowerAuthError::activation_data("state blob magic mismatch"));
        }

        let payload_len = u32::from_le_bytes([blob[5], blob[6], blob[7], blob[8]]) as usize;
        let covered_len = HEADER_SIZE + payload_len;
        if blob.len() < covered_len + 4 {
            return Err(PowerAuthError::activation_data("state blob truncated"));
        }

        let stored_crc = u32::from_le_bytes([
            blob[covered_len],
            blob[covered_len + 1],
            blob[covered_len + 2],
            blob[covered_len + 3],
        ]);
        if crc32fast::hash(&blob[..covered_len]) != stored_crc {
            return Err(PowerAuthError::activation_data("state blob crc mismatch"));
        }

        let version = blob[4];
        if version != STATE_VERSION {
            self.replace_state(ActivationState::Broken);
            return Err(PowerAuthError::activation_data(format!(
                "unknown state blob version {version}"
            )));
        }

        let state = read_state(&blob[HEADER_SIZE..covered_len])?;
        self.replace_state(state);
        Ok(())
    }
}

// Writing

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    debug_assert!(bytes.len() <= usize::from(u16::MAX));
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_pending(out: &mut Vec<u8>, pending: &PendingActivation) {
    out.extend_from_slice(&pending.device_secret_key);
    write_bytes(out, &pending.device_public_key);
    out.extend_from_slice(&pending.ephemeral_secret_key);
    write_bytes(out, pending.activation_id_short.as_bytes());
    write_bytes(out, pending.activation_otp.as_bytes());
    match (
        &pending.master_secret,
        &pending.activation_id,
        &pending.server_public_key,
    ) {
        (Some(master), Some(id), Some(server)) => {
            out.push(1);
            out.extend_from_slice(master);
            write_bytes(out, id.as_bytes());
            write_bytes(out, server);
        }
        _ => out.push(0),
    }
}

fn write_active(out: &mut Vec<u8>, active: &ActiveState) {
    write_bytes(out, active.activation_id.as_bytes());
    write_bytes(out, active.activation_id_short.as_bytes());
    write_bytes(out, &active.server_public_key);
    out.extend_from_slice(&active.possession_envelope);
    out.extend_from_slice(&active.knowledge_envelope);
    match &active.biometry_envelope {
        Some(envelope) => {
            out.push(1);
            out.extend_from_slice(envelope);
        }
        None => out.push(0),
    }
    out.extend_from_slice(&active.transport_envelope);
    write_bytes(out, &active.device_private_key_envelope);
    out.extend_from_slice(&active.counter.to_le_bytes());
}

// Reading

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PowerAuthError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| PowerAuthError::activation_data("state payload truncated"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PowerAuthError> {
        Ok(self.take(N)?.try_into().expect("length checked"))
    }

    fn take_u8(&mut self) -> Result<u8, PowerAuthError> {
        Ok(self.take(1)?[0])
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>, PowerAuthError> {
        let len: [u8; 2] = self.take_array()?;
        Ok(self.take(usize::from(u16::from_le_bytes(len)))?.to_vec())
    }

    fn take_string(&mut self) -> Result<String, PowerAuthError> {
        String::from_utf8(self.take_bytes()?)
            .map_err(|_| PowerAuthError::activation_data("state payload is not utf-8"))
    }

    fn finish(&self) -> Result<(), PowerAuthError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(PowerAuthError::activation_data(
                "state payload has unexpected trailing bytes",
            ))
        }
    }
}

fn read_state(payload: &[u8]) -> Result<ActivationState, PowerAuthError> {
    let mut reader = Reader::new(payload);
    let state = match reader.take_u8()? {
        0 => ActivationState::Empty,
        1 => ActivationState::Pending(read_pending(&mut reader)?),
        2 => ActivationState::Active(read_active(&mut reader)?),
        3 => ActivationState::Broken,
        tag => {
            return Err(PowerAuthError::activation_data(format!(
                "unknown state tag {tag}"
            )))
        }
    };
    reader.finish()?;
    Ok(state)
}

fn read_pending(reader: &mut Reader<'_>) -> Result<PendingActivation, PowerAuthError> {
    let device_secret_key = reader.take_array()?;
    let device_public_key = reader.take_bytes()?;
    let ephemeral_secret_key = reader.take_array()?;
    let activation_id_short = reader.take_string()?;
    let activation_otp = reader.take_string()?;

    let (master_secret, activation_id, server_public_key) = if reader.take_u8()? == 1 {
        let master = reader.take_array()?;
        let id = reader.take_string()?;
        let server = reader.take_bytes()?;
        validate_public_key(&server)?;
        (Some(master), Some(id), Some(server))
    } else {
        (None, None, None)
    };

    validate_public_key(&device_public_key)?;
    Ok(PendingActivation {
        device_secret_key,
        device_public_key,
        ephemeral_secret_key,
        activation_id_short,
        activation_otp,
        master_secret,
        activation_id,
        server_public_key,
    })
}

fn read_active(reader: &mut Reader<'_>) -> Result<ActiveState, PowerAuthError> {
    let activation_id = reader.take_string()?;
    let activation_id_short = reader.take_string()?;
    let server_public_key = reader.take_bytes()?;
    let possession_envelope = reader.take_array()?;
    let knowledge_envelope = reader.take_array()?;
    let biometry_envelope = if reader.take_u8()? == 1 {
        Some(reader.take_array()?)
    } else {
        None
    };
    let transport_envelope = reader.take_array()?;
    let device_private_key_envelope = reader.take_bytes()?;
    let counter = u64::from_le_bytes(reader.take_array()?);

    // Cross-checks: an active state is meaningless without its server
    // identity.
    if activation_id.is_empty() {
        return Err(PowerAuthError::activation_data(
            "active state without activation id",
        ));
    }
    validate_public_key(&server_public_key)?;

    Ok(ActiveState {
        activation_id,
        activation_id_short,
        server_public_key,
        possession_envelope,
        knowledge_envelope,
        biometry_envelope,
        transport_envelope,
        device_private_key_envelope,
        counter,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_setup;
    use super::*;
    use crate::crypto::ecc::EcKeyPair;

    fn sample_active_state(biometry: bool) -> ActiveState {
        let server = EcKeyPair::generate().unwrap();
        ActiveState {
            activation_id: "activation-id".to_string(),
            activation_id_short: "AAAAA-AAAAA".to_string(),
            server_public_key: server.public_key_bytes(),
            possession_envelope: [0x01; 16],
            knowledge_envelope: [0x02; 16],
            biometry_envelope: biometry.then_some([0x03; 16]),
            transport_envelope: [0x04; 16],
            device_private_key_envelope: vec![0x05; 48],
            counter: 42,
        }
    }

    fn sample_pending_state(after_step2: bool) -> PendingActivation {
        let device = EcKeyPair::generate().unwrap();
        let server = EcKeyPair::generate().unwrap();
        PendingActivation {
            device_secret_key: *device.secret_bytes(),
            device_public_key: device.public_key_bytes(),
            ephemeral_secret_key: *device.secret_bytes(),
            activation_id_short: "AAAAA-AAAAA".to_string(),
            activation_otp: "AAAAA-AAAAE".to_string(),
            master_secret: after_step2.then_some([0x07; 16]),
            activation_id: after_step2.then(|| "activation-id".to_string()),
            server_public_key: after_step2.then(|| server.public_key_bytes()),
        }
    }

    fn roundtrip(state: ActivationState) {
        let mut session = Session::new(test_setup()).unwrap();
        session.replace_state(state);
        let blob = session.serialize_state();

        let mut restored = Session::new(test_setup()).unwrap();
        restored.deserialize_state(&blob).unwrap();
        assert_eq!(restored.serialize_state(), blob);
    }

    #[test]
    fn test_roundtrip_empty() {
        roundtrip(ActivationState::Empty);
    }

    #[test]
    fn test_roundtrip_broken() {
        roundtrip(ActivationState::Broken);
    }

    #[test]
    fn test_roundtrip_pending_before_and_after_step2() {
        roundtrip(ActivationState::Pending(sample_pending_state(false)));
        roundtrip(ActivationState::Pending(sample_pending_state(true)));
    }

    #[test]
    fn test_roundtrip_active_with_and_without_biometry() {
        roundtrip(ActivationState::Active(sample_active_state(false)));
        roundtrip(ActivationState::Active(sample_active_state(true)));
    }

    #[test]
    fn test_every_single_byte_flip_is_detected() {
        let mut session = Session::new(test_setup()).unwrap();
        session.replace_state(ActivationState::Active(sample_active_state(true)));
        let blob = session.serialize_state();

        for i in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x40;

            let mut target = Session::new(test_setup()).unwrap();
            target.deserialize_state(&blob).unwrap();
            let counter_before = target.counter();

            let result = target.deserialize_state(&tampered);
            assert!(result.is_err(), "tampered byte {i} was accepted");
            // The previously loaded state must be untouched.
            assert!(target.has_valid_activation());
            assert_eq!(target.counter(), counter_before);
        }
    }

    #[test]
    fn test_truncation_is_detected() {
        let mut session = Session::new(test_setup()).unwrap();
        session.replace_state(ActivationState::Active(sample_active_state(false)));
        let blob = session.serialize_state();

        for len in 0..blob.len() {
            let mut target = Session::new(test_setup()).unwrap();
            assert!(
                target.deserialize_state(&blob[..len]).is_err(),
                "truncation to {len} bytes was accepted"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_tolerated() {
        let mut session = Session::new(test_setup()).unwrap();
        session.replace_state(ActivationState::Active(sample_active_state(false)));
        let mut blob = session.serialize_state();
        blob.extend_from_slice(b"future extension");

        let mut restored = Session::new(test_setup()).unwrap();
        restored.deserialize_state(&blob).unwrap();
        assert!(restored.has_valid_activation());
    }

    #[test]
    fn test_unknown_version_marks_session_broken() {
        let mut session = Session::new(test_setup()).unwrap();
        let mut blob = session.serialize_state();
        blob[4] = 0x7F;
        // Re-seal the CRC so the blob is well-formed, just unknown.
        let covered = blob.len() - 4;
        let crc = crc32fast::hash(&blob[..covered]);
        blob[covered..].copy_from_slice(&crc.to_le_bytes());

        assert!(session.deserialize_state(&blob).is_err());
        assert!(session.is_broken());
    }

    #[test]
    fn test_replacement_is_atomic() {
        let mut session = Session::new(test_setup()).unwrap();
        session.replace_state(ActivationState::Active(sample_active_state(false)));
        let active_blob = session.serialize_state();

        let mut other = Session::new(test_setup()).unwrap();
        other.replace_state(ActivationState::Pending(sample_pending_state(false)));
        let mut corrupt = other.serialize_state();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let mut target = Session::new(test_setup()).unwrap();
        target.deserialize_state(&active_blob).unwrap();
        assert!(target.deserialize_state(&corrupt).is_err());
        assert!(target.has_valid_activation());
    }
}
