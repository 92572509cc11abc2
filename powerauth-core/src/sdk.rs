//! The PowerAuth facade: orchestrates the session, the transport and the
//! persistence store.
//!
//! The session is guarded by a single exclusive lock and never held
//! across an await: the facade acquires the lock, prepares a signed
//! request, releases the lock, awaits the transport and re-acquires the
//! lock to apply the response. Counter ratcheting happens while the lock
//! is held and before transport release, so two concurrent signed
//! requests always receive distinct counter values and a dropped
//! transport task cannot roll state back — at-most-once on the wire,
//! exactly-once in local state.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use zeroize::Zeroizing;

use crate::code::ActivationCode;
use crate::crypto::canonical::signature_data_from_pairs;
use crate::crypto::kdf::normalize_unlock_key;
use crate::crypto::symmetric::KEY_SIZE;
use crate::crypto::random_16;
use crate::encryptor::{EncryptedEnvelope, NonPersonalizedEncryptor};
use crate::error::PowerAuthError;
use crate::session::{
    ActivationStatus, ActivationStep1Param, ActivationStep2Param, Session, SessionSetup,
};
use crate::signature::{HttpAuthorizationHeader, PowerAuthAuthentication, SignatureUnlockKeys};
use crate::store::StateStore;
use crate::transport::{
    endpoints, ActivationCreateCustomRequest, ActivationCreateCustomResponse,
    ActivationCreateRequest, ActivationCreateResponse, ActivationRemoveResponse,
    ActivationStatusRequest, ActivationStatusResponse, BiometricPrompt, Transport,
    VaultUnlockResponse,
};
use crate::util::{b64_decode, b64_encode};

/// Default activation OTP of the custom flow when the caller supplies no
/// secret of their own.
const DEFAULT_CUSTOM_SECRET: &str = "00000-00000";

/// Configuration of one PowerAuth instance.
#[derive(Debug, Clone)]
pub struct PowerAuthConfiguration {
    /// Identifier of this instance in the persistence store.
    pub instance_id: String,
    /// Application key token.
    pub application_key: String,
    /// Application secret shared with the server.
    pub application_secret: String,
    /// Master server public key, SEC1-encoded P-256 point.
    pub master_server_public_key: Vec<u8>,
    /// Optional external encryption key layered over factor envelopes.
    pub external_encryption_key: Option<[u8; KEY_SIZE]>,
}

/// The SDK facade.
///
/// Holds the session under an exclusive lock together with the two
/// platform collaborators. All configuration is passed in explicitly;
/// there is no process-wide state.
pub struct PowerAuth<T, S> {
    session: Mutex<Session>,
    transport: T,
    store: S,
    instance_id: String,
    possession_unlock_key: [u8; KEY_SIZE],
}

impl<T: Transport, S: StateStore> PowerAuth<T, S> {
    /// Creates a facade, validating the configuration and restoring any
    /// previously persisted session state.
    ///
    /// `device_related_data` is stable device-bound entropy (for example
    /// a platform device identifier) folded into the default possession
    /// unlock key.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::NotConfigured`] on an invalid
    /// configuration.
    pub fn new(
        configuration: PowerAuthConfiguration,
        transport: T,
        store: S,
        device_related_data: &[u8],
    ) -> Result<Self, PowerAuthError> {
        let instance_id = configuration.instance_id.clone();
        let mut session = Session::new(SessionSetup {
            application_key: configuration.application_key,
            application_secret: configuration.application_secret,
            master_server_public_key: configuration.master_server_public_key,
            external_encryption_key: configuration.external_encryption_key,
            instance_id: configuration.instance_id,
        })?;

        match store.load(&instance_id) {
            Ok(Some(blob)) => {
                if let Err(e) = session.deserialize_state(&blob) {
                    log::warn!("persisted session state rejected: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("failed to read persisted session state: {e}"),
        }

        Ok(Self {
            session: Mutex::new(session),
            transport,
            store,
            instance_id,
            possession_unlock_key: normalize_unlock_key(device_related_data),
        })
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists the session. A failure is logged and otherwise ignored:
    /// the in-memory counter stays authoritative for the next signature.
    fn persist(&self, session: &Session) {
        if let Err(e) = self.store.save(&self.instance_id, &session.serialize_state()) {
            log::warn!("failed to persist session state: {e}");
        }
    }

    fn biometry_store_key(&self) -> String {
        format!("{}.biometry", self.instance_id)
    }

    fn unlock_keys_for(&self, authentication: &PowerAuthAuthentication) -> SignatureUnlockKeys {
        authentication.unlock_keys(&self.possession_unlock_key)
    }

    // =========================================================================
    // State queries and local lifecycle
    // =========================================================================

    /// Returns `true` when an activation handshake is in progress.
    #[must_use]
    pub fn has_pending_activation(&self) -> bool {
        self.lock_session().has_pending_activation()
    }

    /// Returns `true` when a committed activation exists.
    #[must_use]
    pub fn has_valid_activation(&self) -> bool {
        self.lock_session().has_valid_activation()
    }

    /// Returns `true` when the biometry factor is enrolled and its
    /// persisted blob is present.
    #[must_use]
    pub fn has_biometry_factor(&self) -> bool {
        let enrolled = self.lock_session().has_biometry_factor();
        let blob_present = match self.store.load(&self.biometry_store_key()) {
            Ok(blob) => blob.is_some(),
            Err(e) => {
                log::warn!("failed to read biometry blob: {e}");
                false
            }
        };
        enrolled && blob_present
    }

    /// Returns the activation identifier of a committed activation.
    #[must_use]
    pub fn activation_identifier(&self) -> Option<String> {
        self.lock_session().activation_identifier().map(String::from)
    }

    /// Persists the current session state explicitly, e.g. after direct
    /// low-level session manipulation.
    pub fn save_state(&self) {
        let session = self.lock_session();
        self.persist(&session);
    }

    /// Returns the serialized session state.
    #[must_use]
    pub fn serialized_state(&self) -> Vec<u8> {
        self.lock_session().serialize_state()
    }

    /// Replaces the session state from a serialized blob.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationData`] when the blob is
    /// corrupt; the current state is left untouched.
    pub fn restore_state(&self, blob: &[u8]) -> Result<(), PowerAuthError> {
        self.lock_session().deserialize_state(blob)
    }

    /// Resets the session to *Empty*, discarding any pending or committed
    /// activation, and persists the empty state.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationState`] when the
    /// instance was destroyed.
    pub fn reset(&self) -> Result<(), PowerAuthError> {
        let mut session = self.lock_session();
        session.reset()?;
        self.persist(&session);
        Ok(())
    }

    /// Destroys the instance: zeroizes key material and marks the session
    /// terminally unusable.
    pub fn destroy(&self) {
        self.lock_session().destroy();
    }

    /// Generates a fresh 16-byte signature unlock key, e.g. for a new
    /// biometry enrollment.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::SignatureError`] if the system RNG is
    /// unavailable.
    pub fn generate_signature_unlock_key() -> Result<[u8; KEY_SIZE], PowerAuthError> {
        random_16()
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Creates a new activation from a user-entered activation code by
    /// calling `POST /pa/activation/create` and validating the response.
    ///
    /// Returns the device fingerprint for out-of-band verification. The
    /// session is *Pending* afterwards; call
    /// [`commit_activation`](Self::commit_activation) to finish.
    ///
    /// # Errors
    ///
    /// [`PowerAuthError::InvalidActivationState`] while another handshake
    /// is pending, [`PowerAuthError::InvalidActivationCode`] for a bad
    /// code, [`PowerAuthError::InvalidActivationData`] when the server
    /// response fails its cryptographic checks (the session resets to
    /// *Empty*), or [`PowerAuthError::Network`].
    pub async fn create_activation(
        &self,
        name: Option<&str>,
        activation_code: &str,
        extras: Option<&str>,
    ) -> Result<String, PowerAuthError> {
        let code = ActivationCode::parse(activation_code)?;
        let step1: ActivationStep1Param = code.into();
        let request = self.start_activation_request(name, &step1, extras)?;

        let body = serde_json::to_vec(&request)
            .map_err(|e| PowerAuthError::signature(format!("request encoding failed: {e}")))?;
        let response = self
            .post_or_reset(endpoints::ACTIVATION_CREATE, &[], Some(body))
            .await?;

        let response: ActivationCreateResponse = match serde_json::from_slice(&response) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.abandon_pending_activation();
                return Err(PowerAuthError::activation_data("malformed server response"));
            }
        };

        self.finish_activation_exchange(&ActivationStep2Param {
            activation_id: response.activation_id,
            activation_nonce: response.activation_nonce,
            ephemeral_public_key: response.ephemeral_public_key,
            encrypted_server_public_key: response.encrypted_server_public_key,
            encrypted_server_public_key_signature: response.encrypted_server_public_key_signature,
        })
    }

    /// Creates a new activation from identity attributes (the *custom*
    /// flow): the enrollment request travels to an integration-specific
    /// `url` inside a non-personalized encryption envelope.
    ///
    /// # Errors
    ///
    /// As [`create_activation`](Self::create_activation), plus
    /// [`PowerAuthError::EncryptionFailed`] when the envelope cannot be
    /// produced or opened.
    pub async fn create_custom_activation(
        &self,
        name: Option<&str>,
        identity_attributes: &BTreeMap<String, String>,
        custom_secret: Option<&str>,
        custom_attributes: Option<serde_json::Value>,
        url: &str,
        extras: Option<&str>,
    ) -> Result<String, PowerAuthError> {
        let step1 = ActivationStep1Param {
            activation_id_short: b64_encode(&signature_data_from_pairs(identity_attributes)),
            activation_otp: custom_secret.unwrap_or(DEFAULT_CUSTOM_SECRET).to_string(),
            // The custom flow has no scanned code, so there is no
            // detached signature to verify.
            activation_signature: None,
        };
        let powerauth = self.start_activation_request(name, &step1, extras)?;

        let master_server_public_key = {
            let session = self.lock_session();
            session.setup().master_server_public_key.clone()
        };

        let request = ActivationCreateCustomRequest {
            identity: identity_attributes.clone(),
            custom_attributes,
            powerauth,
        };
        let plaintext = serde_json::to_vec(&request)
            .map_err(|e| PowerAuthError::signature(format!("request encoding failed: {e}")))?;

        let encryptor = NonPersonalizedEncryptor::new(&master_server_public_key)?;
        let envelope = encryptor.encrypt_request(&plaintext)?;
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| PowerAuthError::signature(format!("request encoding failed: {e}")))?;

        let response = self.post_or_reset(url, &[], Some(body)).await?;

        let result: Result<ActivationCreateCustomResponse, PowerAuthError> =
            serde_json::from_slice::<EncryptedEnvelope>(&response)
                .map_err(|_| PowerAuthError::EncryptionFailed)
                .and_then(|envelope| encryptor.decrypt_response(&envelope))
                .and_then(|plaintext| {
                    serde_json::from_slice(&plaintext)
                        .map_err(|_| PowerAuthError::EncryptionFailed)
                });
        let response = match result {
            Ok(parsed) => parsed,
            Err(e) => {
                self.abandon_pending_activation();
                return Err(e);
            }
        };

        self.finish_activation_exchange(&ActivationStep2Param {
            activation_id: response.activation_id,
            activation_nonce: response.activation_nonce,
            ephemeral_public_key: response.ephemeral_public_key,
            encrypted_server_public_key: response.encrypted_server_public_key,
            encrypted_server_public_key_signature: response.encrypted_server_public_key_signature,
        })
    }

    /// Commits a pending activation, storing the factor keys selected by
    /// `authentication`. Possession and knowledge are mandatory; biometry
    /// is enrolled only when the authentication carries its key.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::InvalidActivationState`] unless a
    /// validated handshake is pending.
    pub fn commit_activation(
        &self,
        authentication: &PowerAuthAuthentication,
    ) -> Result<(), PowerAuthError> {
        let unlock = self.unlock_keys_for(authentication);
        let mut session = self.lock_session();
        if !session.has_pending_activation() || session.has_valid_activation() {
            return Err(PowerAuthError::InvalidActivationState);
        }
        session.complete_activation(&unlock)?;
        self.persist(&session);
        Ok(())
    }

    /// Commits a pending activation with possession and the given
    /// password.
    ///
    /// # Errors
    ///
    /// As [`commit_activation`](Self::commit_activation).
    pub fn commit_activation_with_password(&self, password: &str) -> Result<(), PowerAuthError> {
        self.commit_activation(&PowerAuthAuthentication::possession_with_password(password))
    }

    /// Commits a pending activation with possession, password and a
    /// platform-wrapped biometry key, persisting the biometry blob.
    ///
    /// # Errors
    ///
    /// As [`commit_activation`](Self::commit_activation).
    pub fn commit_activation_with_password_and_biometry(
        &self,
        password: &str,
        wrapped_biometry_key: &[u8],
    ) -> Result<(), PowerAuthError> {
        self.commit_activation(&PowerAuthAuthentication::possession_password_biometry(
            password,
            normalize_unlock_key(wrapped_biometry_key),
        ))?;
        if let Err(e) = self.store.save(&self.biometry_store_key(), wrapped_biometry_key) {
            log::warn!("failed to persist biometry blob: {e}");
        }
        Ok(())
    }

    /// Fetches and decodes the activation status from the server.
    ///
    /// # Errors
    ///
    /// [`PowerAuthError::MissingActivation`] with no local activation,
    /// [`PowerAuthError::ActivationPending`] before commit (only local
    /// state exists, the transport key is not established yet),
    /// [`PowerAuthError::InvalidActivationData`] when the blob fails to
    /// decode, or [`PowerAuthError::Network`].
    pub async fn fetch_activation_status(&self) -> Result<ActivationStatus, PowerAuthError> {
        let activation_id = {
            let session = self.lock_session();
            session.active_state()?;
            session
                .activation_identifier()
                .map(String::from)
                .ok_or(PowerAuthError::MissingActivation)?
        };

        let body = serde_json::to_vec(&ActivationStatusRequest { activation_id })
            .map_err(|e| PowerAuthError::signature(format!("request encoding failed: {e}")))?;
        let response = self
            .transport
            .post(endpoints::ACTIVATION_STATUS, &[], Some(body))
            .await?;
        let response: ActivationStatusResponse = serde_json::from_slice(&response)
            .map_err(|_| PowerAuthError::activation_data("malformed server response"))?;
        let blob = b64_decode(&response.encrypted_status_blob)?;

        let unlock = SignatureUnlockKeys::new(Some(self.possession_unlock_key), None, None);
        self.lock_session().decode_activation_status(&blob, &unlock)
    }

    /// Removes the activation on the server with a signed request, then
    /// resets the local session and wipes the biometry blob.
    ///
    /// # Errors
    ///
    /// Signing-path errors, or [`PowerAuthError::Network`]; on a network
    /// failure the local activation is kept.
    pub async fn remove_activation(
        &self,
        authentication: &PowerAuthAuthentication,
    ) -> Result<(), PowerAuthError> {
        let header =
            self.request_signature(authentication, "POST", endpoints::ACTIVATION_REMOVE, None)?;
        let response = self
            .transport
            .post(
                endpoints::ACTIVATION_REMOVE,
                &[(header.key.to_string(), header.value)],
                None,
            )
            .await?;
        let _: ActivationRemoveResponse = serde_json::from_slice(&response)
            .map_err(|_| PowerAuthError::activation_data("malformed server response"))?;

        let mut session = self.lock_session();
        session.reset()?;
        self.persist(&session);
        drop(session);
        if let Err(e) = self.store.remove(&self.biometry_store_key()) {
            log::warn!("failed to remove biometry blob: {e}");
        }
        Ok(())
    }

    // =========================================================================
    // Request signing
    // =========================================================================

    /// Computes the authorization header for an HTTP request, ratcheting
    /// the counter and persisting the session.
    ///
    /// # Errors
    ///
    /// Lifecycle errors when no committed activation exists, or
    /// [`PowerAuthError::SignatureError`] for missing credentials.
    pub fn request_signature(
        &self,
        authentication: &PowerAuthAuthentication,
        method: &str,
        uri_id: &str,
        body: Option<&[u8]>,
    ) -> Result<HttpAuthorizationHeader, PowerAuthError> {
        self.request_signature_internal(authentication, false, method, uri_id, body)
    }

    /// Computes the authorization header for a GET request whose query
    /// parameters are canonicalized into the signed body.
    ///
    /// # Errors
    ///
    /// As [`request_signature`](Self::request_signature).
    pub fn request_get_signature(
        &self,
        authentication: &PowerAuthAuthentication,
        uri_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<HttpAuthorizationHeader, PowerAuthError> {
        let body = signature_data_from_pairs(params);
        self.request_signature_internal(authentication, false, "GET", uri_id, Some(&body))
    }

    fn request_signature_internal(
        &self,
        authentication: &PowerAuthAuthentication,
        vault_unlock: bool,
        method: &str,
        uri_id: &str,
        body: Option<&[u8]>,
    ) -> Result<HttpAuthorizationHeader, PowerAuthError> {
        let unlock = self.unlock_keys_for(authentication);
        let mut session = self.lock_session();
        let header = session.sign_http_request(
            body.unwrap_or_default(),
            method,
            uri_id,
            &unlock,
            authentication.factors(),
            vault_unlock,
        )?;
        // The ratchet happened; persist before the request leaves.
        self.persist(&session);
        Ok(header)
    }

    // =========================================================================
    // Vault-unlock operations
    // =========================================================================

    /// Obtains the one-shot encrypted vault key via a signed
    /// `POST /pa/vault/unlock`.
    async fn fetch_encrypted_vault_key(
        &self,
        authentication: &PowerAuthAuthentication,
    ) -> Result<Vec<u8>, PowerAuthError> {
        let header = self.request_signature_internal(
            authentication,
            true,
            "POST",
            endpoints::VAULT_UNLOCK,
            None,
        )?;
        let response = self
            .transport
            .post(
                endpoints::VAULT_UNLOCK,
                &[(header.key.to_string(), header.value)],
                None,
            )
            .await?;
        let response: VaultUnlockResponse = serde_json::from_slice(&response)
            .map_err(|_| PowerAuthError::activation_data("malformed server response"))?;
        b64_decode(&response.encrypted_vault_encryption_key)
    }

    /// Signs `data` with the device private key held in the secure vault.
    ///
    /// # Errors
    ///
    /// Signing-path and vault errors, or [`PowerAuthError::Network`].
    pub async fn sign_data_with_device_private_key(
        &self,
        authentication: &PowerAuthAuthentication,
        data: &[u8],
    ) -> Result<Vec<u8>, PowerAuthError> {
        let vault_key = self.fetch_encrypted_vault_key(authentication).await?;
        let unlock = SignatureUnlockKeys::new(Some(self.possession_unlock_key), None, None);
        self.lock_session()
            .sign_data_with_device_private_key(&vault_key, &unlock, data)
    }

    /// Derives the custom encryption key at `index` from the vault key.
    ///
    /// # Errors
    ///
    /// Signing-path and vault errors, or [`PowerAuthError::Network`].
    pub async fn fetch_encryption_key(
        &self,
        authentication: &PowerAuthAuthentication,
        index: u64,
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, PowerAuthError> {
        let vault_key = self.fetch_encrypted_vault_key(authentication).await?;
        let unlock = SignatureUnlockKeys::new(Some(self.possession_unlock_key), None, None);
        self.lock_session()
            .derive_cryptographic_key_from_vault_key(&vault_key, &unlock, index)
    }

    /// Changes the user password, proving the old one against the server
    /// first: the vault-unlock request is signed with the knowledge
    /// factor, so it succeeds only for the correct old password.
    ///
    /// # Errors
    ///
    /// Signing-path errors, or [`PowerAuthError::Network`] (which also
    /// covers a rejected old password).
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), PowerAuthError> {
        let authentication = PowerAuthAuthentication::possession_with_password(old_password);
        self.fetch_encrypted_vault_key(&authentication).await?;

        let mut session = self.lock_session();
        session.change_user_password(old_password, new_password)?;
        self.persist(&session);
        Ok(())
    }

    /// Changes the user password locally without validating the old one.
    ///
    /// The caller is responsible for validating `old_password` against
    /// the server first (see [`change_password`](Self::change_password)
    /// or [`validate_password`](Self::validate_password)); a wrong old
    /// password silently corrupts the knowledge factor.
    ///
    /// # Errors
    ///
    /// Lifecycle errors when no committed activation exists.
    pub fn change_password_unsafe(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), PowerAuthError> {
        let mut session = self.lock_session();
        session.change_user_password(old_password, new_password)?;
        self.persist(&session);
        Ok(())
    }

    /// Validates a password against the server through a vault unlock.
    ///
    /// # Errors
    ///
    /// [`PowerAuthError::Network`] when the server rejects the signature
    /// (wrong password), plus the usual signing-path errors.
    pub async fn validate_password(&self, password: &str) -> Result<(), PowerAuthError> {
        let authentication = PowerAuthAuthentication::possession_with_password(password);
        self.fetch_encrypted_vault_key(&authentication).await.map(|_| ())
    }

    /// Enrolls the biometry factor after activation: unlocks the vault
    /// with the password, rederives the biometry key and stores both the
    /// new envelope and the platform-wrapped blob.
    ///
    /// # Errors
    ///
    /// Signing-path and vault errors, or [`PowerAuthError::Network`].
    pub async fn add_biometry_factor(
        &self,
        password: &str,
        wrapped_biometry_key: &[u8],
    ) -> Result<(), PowerAuthError> {
        let authentication = PowerAuthAuthentication::possession_with_password(password);
        let vault_key = self.fetch_encrypted_vault_key(&authentication).await?;

        let unlock = SignatureUnlockKeys::new(
            Some(self.possession_unlock_key),
            Some(normalize_unlock_key(wrapped_biometry_key)),
            None,
        );
        let mut session = self.lock_session();
        session.add_biometry_factor(&vault_key, &unlock)?;
        self.persist(&session);
        drop(session);

        if let Err(e) = self.store.save(&self.biometry_store_key(), wrapped_biometry_key) {
            log::warn!("failed to persist biometry blob: {e}");
        }
        Ok(())
    }

    /// Enrolls the biometry factor, obtaining the platform-wrapped key
    /// through the biometric prompt collaborator.
    ///
    /// # Errors
    ///
    /// As [`add_biometry_factor`](Self::add_biometry_factor), plus
    /// [`PowerAuthError::BiometryCancelled`] when the user dismisses the
    /// prompt.
    pub async fn add_biometry_factor_with_prompt(
        &self,
        password: &str,
        prompt: &dyn BiometricPrompt,
        reason: &str,
    ) -> Result<(), PowerAuthError> {
        let wrapped = prompt.acquire_biometry_key(reason).await?;
        self.add_biometry_factor(password, &wrapped).await
    }

    /// Removes the biometry factor envelope and the persisted blob.
    ///
    /// # Errors
    ///
    /// Lifecycle errors when no committed activation exists.
    pub fn remove_biometry_factor(&self) -> Result<(), PowerAuthError> {
        let mut session = self.lock_session();
        session.remove_biometry_factor()?;
        self.persist(&session);
        drop(session);
        if let Err(e) = self.store.remove(&self.biometry_store_key()) {
            log::warn!("failed to remove biometry blob: {e}");
        }
        Ok(())
    }

    // =========================================================================
    // Activation exchange plumbing
    // =========================================================================

    /// Runs activation step 1 under the lock and assembles the enrollment
    /// request. Rejects the call while another handshake is pending;
    /// otherwise any previous (possibly broken) state is discarded first.
    fn start_activation_request(
        &self,
        name: Option<&str>,
        step1: &ActivationStep1Param,
        extras: Option<&str>,
    ) -> Result<ActivationCreateRequest, PowerAuthError> {
        let mut session = self.lock_session();
        if session.has_pending_activation() {
            return Err(PowerAuthError::InvalidActivationState);
        }
        session.reset()?;
        let result = session.start_activation(step1)?;
        Ok(ActivationCreateRequest {
            activation_id_short: step1.activation_id_short.clone(),
            activation_name: name.map(String::from),
            activation_nonce: result.activation_nonce,
            application_key: session.setup().application_key.clone(),
            application_signature: result.application_signature,
            encrypted_device_public_key: result.encrypted_device_public_key,
            ephemeral_public_key: result.ephemeral_public_key,
            extras: extras.map(String::from),
        })
    }

    /// Validates the server's activation response under the lock and
    /// returns the device fingerprint.
    fn finish_activation_exchange(
        &self,
        step2: &ActivationStep2Param,
    ) -> Result<String, PowerAuthError> {
        let mut session = self.lock_session();
        let result = session.validate_activation_response(step2)?;
        Ok(result.activation_fingerprint)
    }

    /// Posts the enrollment request; a transport failure abandons the
    /// pending handshake so the caller can retry cleanly.
    async fn post_or_reset(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, PowerAuthError> {
        match self.transport.post(path, headers, body).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.abandon_pending_activation();
                Err(e)
            }
        }
    }

    fn abandon_pending_activation(&self) {
        let mut session = self.lock_session();
        if session.has_pending_activation() {
            if let Err(e) = session.reset() {
                log::warn!("failed to abandon pending activation: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ecc::EcKeyPair;
    use crate::store::{MemoryStateStore, StoreError, StoreResult};
    use async_trait::async_trait;

    /// Transport that always fails, for exercising local paths.
    struct OfflineTransport;

    #[async_trait]
    impl Transport for OfflineTransport {
        async fn post(
            &self,
            _path: &str,
            _headers: &[(String, String)],
            _body: Option<Vec<u8>>,
        ) -> Result<Vec<u8>, PowerAuthError> {
            Err(PowerAuthError::network("offline"))
        }
    }

    /// Store that rejects every write.
    struct ReadOnlyStore;

    impl StateStore for ReadOnlyStore {
        fn save(&self, _key: &str, _bytes: &[u8]) -> StoreResult<()> {
            Err(StoreError("read-only".to_string()))
        }
        fn load(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
            Ok(None)
        }
        fn remove(&self, _key: &str) -> StoreResult<()> {
            Err(StoreError("read-only".to_string()))
        }
    }

    fn configuration() -> PowerAuthConfiguration {
        let mut scalar = [0u8; 32];
        scalar[31] = 2;
        let master = EcKeyPair::from_secret_bytes(&scalar).unwrap();
        PowerAuthConfiguration {
            instance_id: "test-instance".to_string(),
            application_key: "app-key".to_string(),
            application_secret: "app-secret".to_string(),
            master_server_public_key: master.public_key_bytes(),
            external_encryption_key: None,
        }
    }

    #[test]
    fn test_new_facade_starts_empty() {
        let sdk =
            PowerAuth::new(configuration(), OfflineTransport, MemoryStateStore::new(), b"device")
                .unwrap();
        assert!(!sdk.has_valid_activation());
        assert!(!sdk.has_pending_activation());
        assert!(sdk.activation_identifier().is_none());
    }

    #[test]
    fn test_corrupt_persisted_state_is_ignored() {
        let store = MemoryStateStore::new();
        store.save("test-instance", b"garbage").unwrap();
        let sdk = PowerAuth::new(configuration(), OfflineTransport, store, b"device").unwrap();
        assert!(!sdk.has_valid_activation());
    }

    #[test]
    fn test_save_state_writes_to_store() {
        let store = std::sync::Arc::new(MemoryStateStore::new());
        let sdk = PowerAuth::new(
            configuration(),
            OfflineTransport,
            std::sync::Arc::clone(&store),
            b"device",
        )
        .unwrap();
        sdk.save_state();
        assert!(store.load("test-instance").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_network_failure_abandons_pending_handshake() {
        let sdk =
            PowerAuth::new(configuration(), OfflineTransport, MemoryStateStore::new(), b"device")
                .unwrap();
        let result = sdk
            .create_activation(None, "AAAAA-AAAAA-AAAAA-AAAAE", None)
            .await;
        assert!(matches!(result, Err(PowerAuthError::Network(_))));
        // The handshake is abandoned; an immediate retry is possible.
        assert!(!sdk.has_pending_activation());
    }

    #[tokio::test]
    async fn test_bad_activation_code_is_rejected_locally() {
        let sdk =
            PowerAuth::new(configuration(), OfflineTransport, MemoryStateStore::new(), b"device")
                .unwrap();
        let result = sdk
            .create_activation(None, "AAAAA-AAAAA-AAAAA-AAAAA", None)
            .await;
        assert!(matches!(result, Err(PowerAuthError::InvalidActivationCode)));
    }

    #[test]
    fn test_commit_without_pending_activation_fails() {
        let sdk =
            PowerAuth::new(configuration(), OfflineTransport, MemoryStateStore::new(), b"device")
                .unwrap();
        assert!(matches!(
            sdk.commit_activation_with_password("1234"),
            Err(PowerAuthError::InvalidActivationState)
        ));
    }

    #[test]
    fn test_signature_without_activation_reports_missing() {
        let sdk =
            PowerAuth::new(configuration(), OfflineTransport, MemoryStateStore::new(), b"device")
                .unwrap();
        let result = sdk.request_signature(
            &PowerAuthAuthentication::possession(),
            "POST",
            "/x",
            Some(b"hi"),
        );
        assert!(matches!(result, Err(PowerAuthError::MissingActivation)));
    }

    #[test]
    fn test_failed_persistence_is_non_fatal() {
        let sdk =
            PowerAuth::new(configuration(), OfflineTransport, ReadOnlyStore, b"device").unwrap();
        // Saving into a read-only store must not error the caller.
        sdk.save_state();
        assert!(sdk.reset().is_ok());
    }
}
