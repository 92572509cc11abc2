//! Client core of the PowerAuth multi-factor authentication and
//! transaction-signing protocol.
//!
//! A mobile device exchanges asymmetric material with a server during an
//! enrollment handshake ("activation"), derives a bundle of long-lived
//! secret keys, and subsequently issues MAC-based signatures over HTTP
//! requests using one or more unlockable factors: *possession* (a
//! device-bound key), *knowledge* (a PIN or password) and *biometry*
//! (a key gated by a platform biometric store).
//!
//! # Architecture
//!
//! The crate is layered the same way the protocol is:
//!
//! 1. [`crypto`] — fixed primitives shared with the server: AES-128-CBC,
//!    HMAC-SHA256, ECDH/ECDSA on P-256, PBKDF2 and the one-block key tree.
//! 2. [`session`] — the activation state machine holding wrapped factor
//!    keys and the monotonic signature counter, with versioned
//!    serialization for at-rest persistence.
//! 3. [`signature`] — factor unlock, signature base string construction
//!    and the `X-PowerAuth-Authorization` header.
//! 4. [`vault`] — privileged operations gated by a server-released vault
//!    encryption key.
//! 5. [`PowerAuth`] — the facade orchestrating the transport collaborator
//!    and the session under a single lock.
//!
//! # Platform Integration
//!
//! The core performs no I/O. Platform capabilities are expressed as traits:
//!
//! - [`transport::Transport`] — issues REST calls (TLS, retries, JSON
//!   framing are the implementor's concern)
//! - [`store::StateStore`] — opaque key→bytes persistence, typically the
//!   platform keychain
//! - [`transport::BiometricPrompt`] — the platform biometric store UI

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod code;
pub mod crypto;
pub mod encryptor;
pub mod error;
pub mod session;
pub mod signature;
pub mod store;
pub mod transport;
pub mod vault;

mod sdk;
mod util;

pub use code::ActivationCode;
pub use error::PowerAuthError;
pub use sdk::{PowerAuth, PowerAuthConfiguration};
pub use session::{ActivationServerState, ActivationStatus, Session, SessionSetup};
pub use signature::{
    HttpAuthorizationHeader, PowerAuthAuthentication, SignatureFactors, SignatureUnlockKeys,
};

/// Result type alias for PowerAuth core operations.
pub type PowerAuthResult<T> = Result<T, PowerAuthError>;
