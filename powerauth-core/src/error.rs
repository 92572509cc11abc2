use thiserror::Error;

/// Error outputs from the PowerAuth client core.
///
/// Every fallible operation surfaces exactly one of these kinds; nothing is
/// retried inside the core. Signature-time failures never corrupt the
/// session, and only a failed cryptographic check during activation resets
/// local state.
#[derive(Debug, Error)]
pub enum PowerAuthError {
    /// The instance has no valid setup (empty application key or secret,
    /// malformed master server public key).
    #[error("not_configured")]
    NotConfigured,

    /// The operation is incompatible with the current activation state.
    #[error("invalid_activation_state")]
    InvalidActivationState,

    /// An operation requiring an activation found none.
    #[error("missing_activation")]
    MissingActivation,

    /// Only local state is available while the activation is still pending.
    #[error("activation_pending")]
    ActivationPending,

    /// The activation code failed to parse or its checksum does not match.
    #[error("invalid_activation_code")]
    InvalidActivationCode,

    /// A cryptographic check failed: ECDSA verification, AES-CBC padding,
    /// MAC mismatch or a corrupt serialized blob.
    #[error("invalid_activation_data: {0}")]
    InvalidActivationData(String),

    /// Internal inconsistency while producing a signature.
    #[error("signature_error: {0}")]
    SignatureError(String),

    /// The non-personalized encryption envelope could not be produced
    /// or opened.
    #[error("encryption_failed")]
    EncryptionFailed,

    /// Opaque error surfaced unchanged from the transport collaborator.
    #[error("network_error: {0}")]
    Network(String),

    /// The biometric prompt collaborator reported user cancellation.
    #[error("biometry_cancelled")]
    BiometryCancelled,
}

impl PowerAuthError {
    /// Creates an `InvalidActivationData` error with context.
    pub fn activation_data<S: Into<String>>(context: S) -> Self {
        Self::InvalidActivationData(context.into())
    }

    /// Creates a `SignatureError` with context.
    pub fn signature<S: Into<String>>(context: S) -> Self {
        Self::SignatureError(context.into())
    }

    /// Creates a `Network` error from any transport failure.
    pub fn network<S: Into<String>>(context: S) -> Self {
        Self::Network(context.into())
    }
}
