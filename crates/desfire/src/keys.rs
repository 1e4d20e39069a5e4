//! Long-term key material
//!
//! Keys are borrowed by the authenticators for the length of one handshake
//! and never copied into a session.

use std::fmt;

use derive_more::Display;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// Cipher a key belongs to
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Single DES, 8 bytes
    #[display("DES")]
    Des,
    /// Two-key triple DES, 16 bytes
    #[display("2K3DES")]
    Tdes,
    /// Three-key triple DES, 24 bytes
    #[display("3K3DES")]
    Tktdes,
    /// AES-128, 16 bytes
    #[display("AES")]
    Aes,
}

impl KeyType {
    /// Key length in bytes
    pub const fn key_len(self) -> usize {
        match self {
            Self::Des => 8,
            Self::Tdes | Self::Aes => 16,
            Self::Tktdes => 24,
        }
    }

    /// Cipher block size in bytes
    pub const fn block_size(self) -> usize {
        match self {
            Self::Des | Self::Tdes | Self::Tktdes => 8,
            Self::Aes => 16,
        }
    }

    /// Length of RndA and RndB in a handshake with this key type
    pub const fn challenge_len(self) -> usize {
        match self {
            Self::Des | Self::Tdes => 8,
            Self::Tktdes | Self::Aes => 16,
        }
    }

    /// Whether the key carries version bits in its parity bits
    pub const fn is_des_family(self) -> bool {
        !matches!(self, Self::Aes)
    }
}

/// A key tagged with its type
///
/// The length is checked on construction and the bytes are wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    #[zeroize(skip)]
    key_type: KeyType,
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Create key material, checking its length against the key type
    pub fn new(key_type: KeyType, bytes: &[u8]) -> Result<Self> {
        check_key_len(key_type, bytes)?;
        Ok(Self {
            key_type,
            bytes: bytes.to_vec(),
        })
    }

    /// The all-zero factory default key of a type
    pub fn zero(key_type: KeyType) -> Self {
        Self {
            key_type,
            bytes: vec![0; key_type.key_len()],
        }
    }

    /// Key type
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy of this key with `version` stored in the parity bits
    ///
    /// Bit 7 of the version goes into byte 0, bit 0 into byte 7, repeating
    /// for every further 8 byte segment. AES keys are returned unchanged.
    pub fn with_version(&self, version: u8) -> Self {
        let mut key = self.clone();
        if self.key_type.is_des_family() {
            for (i, byte) in key.bytes.iter_mut().enumerate() {
                let bit = (version >> (7 - i % 8)) & 0x01;
                *byte = (*byte & 0xFE) | bit;
            }
        }
        key
    }

    /// Version read back from the parity bits, `None` for AES keys
    pub fn version(&self) -> Option<u8> {
        self.key_type.is_des_family().then(|| {
            self.bytes[..8]
                .iter()
                .fold(0u8, |version, byte| (version << 1) | (byte & 0x01))
        })
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_type", &self.key_type)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Check a raw key against the length its type requires
pub fn check_key_len(key_type: KeyType, key: &[u8]) -> Result<()> {
    if key.len() == key_type.key_len() {
        Ok(())
    } else {
        Err(Error::InvalidKeyLength {
            key_type,
            expected: key_type.key_len(),
            actual: key.len(),
        })
    }
}
