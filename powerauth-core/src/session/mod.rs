//! Session: the activation state machine and its persistence format.
//!
//! A `Session` holds the immutable instance setup and exactly one
//! activation state discriminant. It performs no I/O: callers persist the
//! blob produced by [`Session::serialize_state`] through a
//! [`StateStore`](crate::store::StateStore) and drive network exchanges
//! through the facade. All cryptographic routines are CPU-only, so a
//! session is safely guarded by a single exclusive lock.

mod activation;
mod serialize;
pub(crate) mod state;
mod status;

pub use activation::{
    ActivationStep1Param, ActivationStep1Result, ActivationStep2Param, ActivationStep2Result,
};
pub use status::{ActivationServerState, ActivationStatus};

use zeroize::Zeroize;

use crate::crypto::ecc::validate_public_key;
use crate::crypto::kdf::derive_password_key;
use crate::crypto::symmetric::KEY_SIZE;
use crate::error::PowerAuthError;

use state::{open_key, seal_key, ActivationState};

/// Immutable configuration of one PowerAuth instance.
///
/// Constructed once at startup and validated by [`Session::new`], so an
/// invalid setup can never be observed by later operations.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    /// Application key identifying the application version (base64 token).
    pub application_key: String,
    /// Application secret shared with the server (base64 token).
    pub application_secret: String,
    /// Master server public key, SEC1-encoded P-256 point.
    pub master_server_public_key: Vec<u8>,
    /// Optional external encryption key layered over factor envelopes.
    pub external_encryption_key: Option<[u8; KEY_SIZE]>,
    /// Identifier of this instance in the persistence store.
    pub instance_id: String,
}

impl SessionSetup {
    fn validate(&self) -> Result<(), PowerAuthError> {
        if self.application_key.is_empty()
            || self.application_secret.is_empty()
            || self.instance_id.is_empty()
        {
            return Err(PowerAuthError::NotConfigured);
        }
        validate_public_key(&self.master_server_public_key)
            .map_err(|_| PowerAuthError::NotConfigured)
    }
}

/// The central entity: activation state plus the setup it belongs to.
pub struct Session {
    setup: SessionSetup,
    state: ActivationState,
    destroyed: bool,
}

impl Session {
    /// Creates a session from a validated setup.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::NotConfigured`] when the application key,
    /// secret or instance identifier is empty, or the master server public
    /// key is not a valid P-256 point.
    pub fn new(setup: SessionSetup) -> Result<Self, PowerAuthError> {
        setup.validate()?;
        Ok(Self {
            setup,
            state: ActivationState::Empty,
            destroyed: false,
        })
    }

    /// Returns the setup this session was created with.
    #[must_use]
    pub const fn setup(&self) -> &SessionSetup {
        &self.setup
    }

    /// Returns `true` while the session has a valid setup and has not
    /// been destroyed.
    #[must_use]
    pub const fn has_valid_setup(&self) -> bool {
        !self.destroyed
    }

    /// Returns `true` when an activation handshake is in progress.
    #[must_use]
    pub const fn has_pending_activation(&self) -> bool {
        matches!(self.state, ActivationState::Pending(_))
    }

    /// Returns `true` when a committed activation exists.
    #[must_use]
    pub const fn has_valid_activation(&self) -> bool {
        matches!(self.state, ActivationState::Active(_))
    }

    /// Returns `true` when the session detected a cryptographic
    /// inconsistency and must be reset.
    #[must_use]
    pub const fn is_broken(&self) -> bool {
        matches!(self.state, ActivationState::Broken)
    }

    /// Returns `true` when the active state carries a biometry envelope.
    #[must_use]
    pub const fn has_biometry_factor(&self) -> bool {
        matches!(
            &self.state,
            ActivationState::Active(active) if active.biometry_envelope.is_some()
        )
    }

    /// Returns the activation identifier of a committed activation.
    #[must_use]
    pub fn activation_identifier(&self) -> Option<&str> {
        match &self.state {
            ActivationState::Active(active) => Some(&active.activation_id),
            _ => None,
        }
    }

    /// Returns the current signature counter of a committed activation.
    #[must_use]
    pub const fn counter(&self) -> Option<u64> {
        match &self.state {
            ActivationState::Active(active) => Some(active.counter),
            _ => None,
        }
    }

    /// Returns the low-order byte of the signature counter.
    #[must_use]
    pub const fn counter_byte(&self) -> Option<u8> {
        match &self.state {
            ActivationState::Active(active) => Some(active.counter_byte()),
            _ => None,
        }
    }

    /// Resets the session to *Empty*, zeroizing all key material.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationState`] when the session
    /// was destroyed.
    pub fn reset(&mut self) -> Result<(), PowerAuthError> {
        if self.destroyed {
            return Err(PowerAuthError::InvalidActivationState);
        }
        self.replace_state(ActivationState::Empty);
        Ok(())
    }

    /// Destroys the session: zeroizes key material and marks the instance
    /// terminally unusable. Every later operation fails.
    pub fn destroy(&mut self) {
        self.replace_state(ActivationState::Broken);
        if let Some(eek) = self.setup.external_encryption_key.as_mut() {
            eek.zeroize();
        }
        self.destroyed = true;
    }

    /// Re-encrypts the knowledge-key envelope from `old_password` to
    /// `new_password` locally.
    ///
    /// The old password is **not** validated: the envelope has no
    /// integrity check, so a wrong old password silently re-wraps a
    /// garbage key and permanently corrupts the knowledge factor. Callers
    /// must prove the old password first through a vault unlock.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::MissingActivation`] or
    /// [`PowerAuthError::InvalidActivationState`] when no committed
    /// activation exists.
    pub fn change_user_password(
        &mut self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), PowerAuthError> {
        let eek = self.setup.external_encryption_key;
        let active = self.active_state_mut()?;

        let mut old_unlock = derive_password_key(old_password, &active.activation_id_short);
        let mut new_unlock = derive_password_key(new_password, &active.activation_id_short);
        let mut key = open_key(&old_unlock, eek.as_ref(), &active.knowledge_envelope);
        active.knowledge_envelope = seal_key(&new_unlock, eek.as_ref(), &key);

        key.zeroize();
        old_unlock.zeroize();
        new_unlock.zeroize();
        Ok(())
    }

    /// Removes the biometry factor envelope.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::MissingActivation`] or
    /// [`PowerAuthError::InvalidActivationState`] when no committed
    /// activation exists.
    pub fn remove_biometry_factor(&mut self) -> Result<(), PowerAuthError> {
        let active = self.active_state_mut()?;
        active.biometry_envelope = None;
        Ok(())
    }

    /// Replaces the state, letting the previous value zeroize on drop.
    pub(crate) fn replace_state(&mut self, next: ActivationState) {
        self.state = next;
    }

    pub(crate) const fn state(&self) -> &ActivationState {
        &self.state
    }

    /// Borrows the committed activation state, mapping the lifecycle to
    /// the error taxonomy: *Empty* reports a missing activation, *Pending*
    /// a pending one, *Broken* and destroyed sessions an invalid state.
    pub(crate) fn active_state(&self) -> Result<&state::ActiveState, PowerAuthError> {
        if self.destroyed {
            return Err(PowerAuthError::InvalidActivationState);
        }
        match &self.state {
            ActivationState::Active(active) => Ok(active),
            ActivationState::Empty => Err(PowerAuthError::MissingActivation),
            ActivationState::Pending(_) => Err(PowerAuthError::ActivationPending),
            ActivationState::Broken => Err(PowerAuthError::InvalidActivationState),
        }
    }

    pub(crate) fn active_state_mut(&mut self) -> Result<&mut state::ActiveState, PowerAuthError> {
        if self.destroyed {
            return Err(PowerAuthError::InvalidActivationState);
        }
        match &mut self.state {
            ActivationState::Active(active) => Ok(active),
            ActivationState::Empty => Err(PowerAuthError::MissingActivation),
            ActivationState::Pending(_) => Err(PowerAuthError::ActivationPending),
            ActivationState::Broken => Err(PowerAuthError::InvalidActivationState),
        }
    }

    pub(crate) fn pending_state_mut(
        &mut self,
    ) -> Result<&mut state::PendingActivation, PowerAuthError> {
        if self.destroyed {
            return Err(PowerAuthError::InvalidActivationState);
        }
        match &mut self.state {
            ActivationState::Pending(pending) => Ok(pending),
            _ => Err(PowerAuthError::InvalidActivationState),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            ActivationState::Empty => "Empty",
            ActivationState::Pending(_) => "Pending",
            ActivationState::Active(_) => "Active",
            ActivationState::Broken => "Broken",
        };
        f.debug_struct("Session")
            .field("instance_id", &self.setup.instance_id)
            .field("state", &state)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::crypto::ecc::EcKeyPair;

    /// A setup with a well-formed master server public key, for unit tests.
    pub(crate) fn test_setup() -> SessionSetup {
        let master = EcKeyPair::from_secret_bytes(&scalar(2)).unwrap();
        SessionSetup {
            application_key: "test-app-key".to_string(),
            application_secret: "test-app-secret".to_string(),
            master_server_public_key: master.public_key_bytes(),
            external_encryption_key: None,
            instance_id: "test-instance".to_string(),
        }
    }

    /// A 32-byte big-endian scalar with the given low value.
    pub(crate) fn scalar(value: u8) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[31] = value;
        out
    }
}
