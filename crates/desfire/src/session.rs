//! Authenticated session state
//!
//! An [`AuthenticationSession`] is the product of a successful handshake. It
//! owns the derived session keys and the chaining state that secure messaging
//! needs between commands.

use derive_more::Display;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::KeyType;

/// Which handshake produced a session
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMode {
    /// `0x0A` with DES or 2K3DES
    #[display("D40")]
    LegacyD40,
    /// `0x1A` with 3K3DES
    #[display("EV1 ISO")]
    LegacyIso,
    /// `0xAA` with AES
    #[display("EV1 AES")]
    LegacyAes,
    /// `0x71`
    #[display("EV2 first")]
    Ev2First,
    /// `0x77`
    #[display("EV2 non-first")]
    Ev2NonFirst,
}

impl AuthMode {
    /// Whether this is an EV2 session
    pub const fn is_ev2(self) -> bool {
        matches!(self, Self::Ev2First | Self::Ev2NonFirst)
    }

    /// Whether this is an EV1 session (ISO or AES handshake)
    pub const fn is_ev1(self) -> bool {
        matches!(self, Self::LegacyIso | Self::LegacyAes)
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SessionKeys {
    enc: Vec<u8>,
    mac: Option<Vec<u8>>,
}

/// PICC and PCD capabilities exchanged by EV2 first authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// PDcap2
    pub pd_cap2: [u8; 6],
    /// PCDcap2
    pub pcd_cap2: [u8; 6],
}

/// Read-only view of a session, safe to log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDiagnostics {
    /// Key number used to authenticate
    pub key_number: u8,
    /// Handshake that produced the session
    pub mode: AuthMode,
    /// EV2 command counter
    pub command_counter: u16,
    /// EV2 transaction identifier
    pub transaction_identifier: Option<[u8; 4]>,
    /// Whether session keys are present
    pub live: bool,
}

/// State of an authenticated session
pub struct AuthenticationSession {
    key_type: KeyType,
    key_number: u8,
    mode: AuthMode,
    keys: Option<SessionKeys>,
    command_counter: u16,
    transaction_identifier: Option<[u8; 4]>,
    iv: Vec<u8>,
    capabilities: Option<Capabilities>,
}

impl AuthenticationSession {
    /// Session from a legacy handshake with a single combined session key
    pub(crate) fn legacy(
        key_type: KeyType,
        key_number: u8,
        mode: AuthMode,
        session_key: Vec<u8>,
    ) -> Self {
        Self {
            key_type,
            key_number,
            mode,
            keys: Some(SessionKeys {
                enc: session_key,
                mac: None,
            }),
            command_counter: 0,
            transaction_identifier: None,
            iv: vec![0; key_type.block_size()],
            capabilities: None,
        }
    }

    /// Session from an EV2 first authentication
    pub(crate) fn ev2_first(
        key_number: u8,
        enc: &[u8; 16],
        mac: &[u8; 16],
        transaction_identifier: [u8; 4],
        capabilities: Capabilities,
    ) -> Self {
        Self {
            key_type: KeyType::Aes,
            key_number,
            mode: AuthMode::Ev2First,
            keys: Some(SessionKeys {
                enc: enc.to_vec(),
                mac: Some(mac.to_vec()),
            }),
            command_counter: 0,
            transaction_identifier: Some(transaction_identifier),
            iv: vec![0; 16],
            capabilities: Some(capabilities),
        }
    }

    /// Install keys from an EV2 non-first authentication, keeping counter and
    /// transaction identifier
    pub(crate) fn rekey_non_first(&mut self, key_number: u8, enc: &[u8; 16], mac: &[u8; 16]) {
        self.keys = Some(SessionKeys {
            enc: enc.to_vec(),
            mac: Some(mac.to_vec()),
        });
        self.key_number = key_number;
        self.mode = AuthMode::Ev2NonFirst;
    }

    /// Key type of the authentication key
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Key number used to authenticate
    pub const fn key_number(&self) -> u8 {
        self.key_number
    }

    /// Handshake that produced this session
    pub const fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Whether the session still holds keys
    pub const fn is_live(&self) -> bool {
        self.keys.is_some()
    }

    /// EV2 command counter
    pub const fn command_counter(&self) -> u16 {
        self.command_counter
    }

    /// EV2 transaction identifier
    pub const fn transaction_identifier(&self) -> Option<[u8; 4]> {
        self.transaction_identifier
    }

    /// Capabilities exchanged by EV2 first authentication
    pub const fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities
    }

    /// Chaining IV of an EV1 session, advanced by every CMAC and cryptogram
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Whether an EV2 non-first authentication may build on this session
    pub const fn allows_non_first(&self) -> bool {
        self.mode.is_ev2() && self.transaction_identifier.is_some()
    }

    /// Zeroize the keys and clear all chaining state
    pub fn invalidate(&mut self) {
        self.keys = None;
        self.command_counter = 0;
        self.transaction_identifier = None;
        self.iv.zeroize();
        self.capabilities = None;
    }

    /// Zeroize the keys only; counter and transaction identifier survive
    pub fn invalidate_keys(&mut self) {
        self.keys = None;
    }

    /// Snapshot for logging
    pub const fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            key_number: self.key_number,
            mode: self.mode,
            command_counter: self.command_counter,
            transaction_identifier: self.transaction_identifier,
            live: self.keys.is_some(),
        }
    }

    pub(crate) fn enc_key(&self) -> Option<&[u8]> {
        self.keys.as_ref().map(|keys| keys.enc.as_slice())
    }

    pub(crate) fn mac_key(&self) -> Option<&[u8]> {
        self.keys.as_ref().and_then(|keys| keys.mac.as_deref())
    }

    pub(crate) fn set_command_counter(&mut self, counter: u16) {
        self.command_counter = counter;
    }

    pub(crate) fn set_iv(&mut self, iv: &[u8]) {
        self.iv.clear();
        self.iv.extend_from_slice(iv);
    }
}

impl std::fmt::Debug for AuthenticationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationSession")
            .field("key_type", &self.key_type)
            .field("key_number", &self.key_number)
            .field("mode", &self.mode)
            .field("live", &self.is_live())
            .field("command_counter", &self.command_counter)
            .field("transaction_identifier", &self.transaction_identifier)
            .finish_non_exhaustive()
    }
}

impl Drop for AuthenticationSession {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}
