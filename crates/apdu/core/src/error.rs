//! Core error type for native APDU exchange
//!
//! Card status words that end an exchange are mapped here. The two statuses
//! with a fixed protocol meaning get their own variants; every other code is
//! surfaced verbatim as [`Error::Status`].

use crate::response::status::StatusWord;
use crate::transport::TransportError;

/// Result type for core operations
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The transport failed; never retried internally
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Response too short or otherwise unusable
    #[error("Malformed response: {0}")]
    MalformedResponse(&'static str),

    /// Command parameters do not fit a single short APDU
    #[error("Command data too long: {0} bytes")]
    CommandTooLong(usize),

    /// Card answered permission denied (91 9D)
    #[error("Access denied by card")]
    AccessDenied,

    /// Card answered authentication error (91 AE)
    #[error("Authentication required")]
    AuthenticationRequired,

    /// Any other terminal status word
    #[error("Card returned status {status}: {}", .status.description())]
    Status {
        /// Status word returned by the card
        status: StatusWord,
    },

    /// More continuation frames than configured
    #[error("Frame limit exceeded after {0} frames")]
    FrameLimitExceeded(usize),
}

impl Error {
    /// Create a new status error
    pub const fn status(status: StatusWord) -> Self {
        Self::Status { status }
    }

    /// Get the status word carried by this error, if any
    pub const fn status_word(&self) -> Option<StatusWord> {
        match self {
            Self::AccessDenied => Some(StatusWord::PERMISSION_DENIED),
            Self::AuthenticationRequired => Some(StatusWord::AUTHENTICATION_ERROR),
            Self::Status { status } => Some(*status),
            _ => None,
        }
    }

    /// Whether the underlying cause is a transport failure
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
