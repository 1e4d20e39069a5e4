//! Core traits and types for MIFARE DESFire native APDU exchange
//!
//! This crate provides the foundational pieces that every DESFire operation is
//! built on:
//!
//! - A raw-bytes [`CardTransport`] contract implemented by reader backends
//! - [`StatusWord`] interpretation for the `91 xx` native status family
//! - The [`Framer`], which wraps commands in the `90 cmd 00 00 Lc data 00`
//!   envelope and drives `91 AF` continuation frames
//!
//! Cryptography and session handling live in the `desfire` crate; this crate
//! has no knowledge of keys or communication modes.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod config;
pub mod framer;
pub mod response;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

mod error;
pub use error::{Error, Result};

pub use config::FramerConfig;
pub use framer::{Framer, check_status, payload_of, status_of, wrap};
pub use response::Response;
pub use response::status::StatusWord;
pub use transport::{CardTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Bytes, BytesMut, CardTransport, Error, Framer, FramerConfig, Response, Result,
        StatusWord, TransportError,
    };
}
