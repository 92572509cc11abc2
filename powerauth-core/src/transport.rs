//! External collaborator interfaces and the REST data model.
//!
//! The core performs no I/O: REST calls, TLS, retries and the biometric
//! prompt UI live behind these traits. Request and response bodies are
//! JSON; the DTOs here mirror the PowerAuth 2.0 Standard RESTful API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PowerAuthError;

/// Endpoint identifiers, used both as request paths and as the signed
/// `uri_id` of the signature base string.
pub mod endpoints {
    /// Standard activation enrollment.
    pub const ACTIVATION_CREATE: &str = "/pa/activation/create";
    /// Activation status lookup.
    pub const ACTIVATION_STATUS: &str = "/pa/activation/status";
    /// Signed activation removal.
    pub const ACTIVATION_REMOVE: &str = "/pa/activation/remove";
    /// Signed vault unlock.
    pub const VAULT_UNLOCK: &str = "/pa/vault/unlock";
}

/// Issues REST calls against the PowerAuth server.
///
/// Implementations own connection management, TLS (including pinning)
/// and retry policy. Errors are surfaced to the core unchanged as
/// [`PowerAuthError::Network`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a POST request and returns the raw response body.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::Network`] on any transport failure.
    async fn post(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, PowerAuthError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn post(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, PowerAuthError> {
        (**self).post(path, headers, body).await
    }
}

/// Drives the platform biometric prompt.
///
/// On success the implementation returns the platform-wrapped biometry
/// key bytes; the core folds them into a 16-byte unlock key. User
/// cancellation surfaces as [`PowerAuthError::BiometryCancelled`].
#[async_trait]
pub trait BiometricPrompt: Send + Sync {
    /// Prompts the user and releases the wrapped biometry key.
    ///
    /// # Errors
    ///
    /// Returns [`PowerAuthError::BiometryCancelled`] when the user
    /// dismisses the prompt.
    async fn acquire_biometry_key(&self, reason: &str) -> Result<Vec<u8>, PowerAuthError>;
}

// =============================================================================
// REST data model
// =============================================================================

/// Request body of `POST /pa/activation/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationCreateRequest {
    /// Short activation identifier.
    pub activation_id_short: String,
    /// Human-readable activation name, e.g. the device model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_name: Option<String>,
    /// Client nonce (base64).
    pub activation_nonce: String,
    /// Application key token.
    pub application_key: String,
    /// HMAC proof of the application secret (base64).
    pub application_signature: String,
    /// Encrypted device public key (base64).
    pub encrypted_device_public_key: String,
    /// Client ephemeral public key (base64).
    pub ephemeral_public_key: String,
    /// Application-specific extra attributes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<String>,
}

/// Response body of `POST /pa/activation/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationCreateResponse {
    /// Activation identifier assigned by the server.
    pub activation_id: String,
    /// Server nonce (base64).
    pub activation_nonce: String,
    /// Server ephemeral public key (base64).
    pub ephemeral_public_key: String,
    /// Encrypted server public key (base64).
    pub encrypted_server_public_key: String,
    /// Master-key ECDSA signature over the response keys (base64).
    pub encrypted_server_public_key_signature: String,
}

/// Request body of the custom activation flow, wrapped in a
/// non-personalized envelope before transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationCreateCustomRequest {
    /// Identity attributes evaluated by the server integration.
    pub identity: BTreeMap<String, String>,
    /// Free-form attributes passed through to the integration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_attributes: Option<serde_json::Value>,
    /// The embedded standard enrollment request.
    pub powerauth: ActivationCreateRequest,
}

/// Response body of the custom activation flow, recovered from the
/// encrypted envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationCreateCustomResponse {
    /// Activation identifier assigned by the server.
    pub activation_id: String,
    /// Server nonce (base64).
    pub activation_nonce: String,
    /// Server ephemeral public key (base64).
    pub ephemeral_public_key: String,
    /// Encrypted server public key (base64).
    pub encrypted_server_public_key: String,
    /// Master-key ECDSA signature over the response keys (base64).
    pub encrypted_server_public_key_signature: String,
}

/// Request body of `POST /pa/activation/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationStatusRequest {
    /// Activation identifier.
    pub activation_id: String,
}

/// Response body of `POST /pa/activation/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationStatusResponse {
    /// Encrypted status blob (base64).
    pub encrypted_status_blob: String,
}

/// Response body of `POST /pa/vault/unlock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultUnlockResponse {
    /// Vault encryption key wrapped with the transport key (base64).
    pub encrypted_vault_encryption_key: String,
}

/// Response body of `POST /pa/activation/remove`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRemoveResponse {
    /// Removal status reported by the server.
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_serializes_camel_case() {
        let request = ActivationCreateRequest {
            activation_id_short: "AAAAA-AAAAA".to_string(),
            activation_name: Some("John's phone".to_string()),
            activation_nonce: "bm9uY2U=".to_string(),
            application_key: "app-key".to_string(),
            application_signature: "c2ln".to_string(),
            encrypted_device_public_key: "a2V5".to_string(),
            ephemeral_public_key: "ZXBo".to_string(),
            extras: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"activationIdShort\""));
        assert!(json.contains("\"encryptedDevicePublicKey\""));
        assert!(!json.contains("extras"));
    }

    #[test]
    fn test_create_response_deserializes_camel_case() {
        let json = r#"{
            "activationId": "id",
            "activationNonce": "bm9uY2U=",
            "ephemeralPublicKey": "ZXBo",
            "encryptedServerPublicKey": "a2V5",
            "encryptedServerPublicKeySignature": "c2ln"
        }"#;
        let response: ActivationCreateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.activation_id, "id");
        assert_eq!(response.encrypted_server_public_key, "a2V5");
    }

    #[test]
    fn test_vault_unlock_response_field_name() {
        let json = r#"{"encryptedVaultEncryptionKey": "dmF1bHQ="}"#;
        let response: VaultUnlockResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.encrypted_vault_encryption_key, "dmF1bHQ=");
    }
}
