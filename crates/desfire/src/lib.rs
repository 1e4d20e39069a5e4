//! MIFARE DESFire authentication and secure messaging
//!
//! This crate implements the host side of the DESFire native protocol for
//! D40, EV1, EV2 and EV3 cards: the mutual authentication handshakes, session
//! key derivation, and the Plain, MACed and Full communication modes.
//!
//! The main entry point is the [`Desfire`] struct, which owns a
//! [`CardTransport`](desfire_apdu_core::CardTransport) and keeps the session
//! produced by the last successful authentication. The building blocks it
//! uses are public as well, for callers that drive their own exchanges.

#![forbid(unsafe_code)]

pub mod application;
pub mod auth;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod secure_messaging;
pub mod session;

#[cfg(test)]
mod test_utils;

// Re-exports
pub use application::{AuthResult, CardGeneration, ComponentVersion, Desfire, VersionInfo};
pub use auth::{AuthOutcome, Ev2Authenticator, LegacyAuthenticator, LegacyState};
pub use error::{Error, Result};
pub use keys::{KeyMaterial, KeyType};
pub use secure_messaging::{CommunicationMode, SecureMessagingSession};
pub use session::{AuthMode, AuthenticationSession, Capabilities, SessionDiagnostics};

// Re-export from desfire_apdu_core for convenience
pub use desfire_apdu_core::{Framer, FramerConfig, StatusWord};
