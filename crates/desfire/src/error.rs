use desfire_apdu_core::StatusWord;
use thiserror::Error;

use crate::{keys::KeyType, secure_messaging::CommunicationMode, session::AuthMode};

/// Result type for DESFire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for DESFire operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Framing, status or transport errors
    #[error(transparent)]
    Apdu(#[from] desfire_apdu_core::Error),

    /// Argument rejected before talking to the card
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Key length does not match its key type
    #[error("Invalid {key_type} key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Key type the material was tagged with
        key_type: KeyType,
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(&'static str),

    /// Card answered a handshake step with an unexpected status
    #[error("Unexpected status {status} during {step}")]
    Protocol {
        /// Handshake step
        step: &'static str,
        /// Status word returned by the card
        status: StatusWord,
    },

    /// Card response has the wrong shape
    #[error("Malformed response during {step}: {reason}")]
    MalformedResponse {
        /// Operation step
        step: &'static str,
        /// What was wrong
        reason: &'static str,
    },

    /// Secured command without a live session
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Operation is not valid in the current state
    #[error("Precondition failed: {0}")]
    Precondition(&'static str),

    /// MAC or CRC mismatch
    #[error("Integrity check failed: {0}")]
    IntegrityCheck(&'static str),

    /// Communication mode not available for this session kind
    #[error("{mode} communication is not supported by {auth} sessions")]
    UnsupportedMode {
        /// Requested mode
        mode: CommunicationMode,
        /// Mode of the active session
        auth: AuthMode,
    },
}

impl Error {
    /// Create a malformed response error
    pub const fn malformed(step: &'static str, reason: &'static str) -> Self {
        Self::MalformedResponse { step, reason }
    }

    /// Status word carried by this error, if any
    pub const fn status_word(&self) -> Option<StatusWord> {
        match self {
            Self::Apdu(e) => e.status_word(),
            Self::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the failure came from the transport
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Apdu(e) if e.is_transport())
    }
}

impl From<desfire_apdu_core::TransportError> for Error {
    fn from(error: desfire_apdu_core::TransportError) -> Self {
        Self::Apdu(error.into())
    }
}
