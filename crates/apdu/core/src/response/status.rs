//! Status word definitions for native DESFire responses

use std::fmt;

use tracing::Level;

/// Status Word (SW1-SW2) from a wrapped DESFire response
///
/// Native commands wrapped in ISO 7816-4 answer with SW1 = `0x91` and the
/// DESFire status code in SW2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Operation ok (91 00)
    pub const OPERATION_OK: Self = Self::new(0x91, 0x00);
    /// ISO success (90 00), accepted as a terminal success
    pub const ISO_SUCCESS: Self = Self::new(0x90, 0x00);
    /// More frames to follow (91 AF)
    pub const ADDITIONAL_FRAME: Self = Self::new(0x91, 0xAF);
    /// Authentication error or missing authentication (91 AE)
    pub const AUTHENTICATION_ERROR: Self = Self::new(0x91, 0xAE);
    /// Permission denied (91 9D)
    pub const PERMISSION_DENIED: Self = Self::new(0x91, 0x9D);
    /// Integrity error (91 1E)
    pub const INTEGRITY_ERROR: Self = Self::new(0x91, 0x1E);
    /// Length error (91 7E)
    pub const LENGTH_ERROR: Self = Self::new(0x91, 0x7E);
    /// Parameter error (91 9E)
    pub const PARAMETER_ERROR: Self = Self::new(0x91, 0x9E);
    /// Application not found (91 A0)
    pub const APPLICATION_NOT_FOUND: Self = Self::new(0x91, 0xA0);
    /// File not found (91 F0)
    pub const FILE_NOT_FOUND: Self = Self::new(0x91, 0xF0);
    /// Boundary error (91 BE)
    pub const BOUNDARY_ERROR: Self = Self::new(0x91, 0xBE);
    /// Command aborted (91 CA)
    pub const COMMAND_ABORTED: Self = Self::new(0x91, 0xCA);

    /// Create a new status word
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Create from a u16 value (SW1 | SW2)
    pub const fn from_u16(status: u16) -> Self {
        Self {
            sw1: (status >> 8) as u8,
            sw2: status as u8,
        }
    }

    /// Convert to a u16 value (SW1 | SW2)
    pub const fn to_u16(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Check if this status word is a native DESFire status (91 XX)
    pub const fn is_native(&self) -> bool {
        self.sw1 == 0x91
    }

    /// Check if this status word ends an exchange successfully (91 00 or 90 00)
    pub const fn is_ok(&self) -> bool {
        self.sw2 == 0x00 && (self.sw1 == 0x91 || self.sw1 == 0x90)
    }

    /// Check if the card has more frames to send or expects more data (91 AF)
    pub const fn is_additional_frame(&self) -> bool {
        self.sw1 == 0x91 && self.sw2 == 0xAF
    }

    /// Check if this status word is an authentication error (91 AE)
    pub const fn is_authentication_error(&self) -> bool {
        self.sw1 == 0x91 && self.sw2 == 0xAE
    }

    /// Check if this status word is permission denied (91 9D)
    pub const fn is_permission_denied(&self) -> bool {
        self.sw1 == 0x91 && self.sw2 == 0x9D
    }

    /// Get the appropriate tracing level for this status word
    pub const fn tracing_level(&self) -> Level {
        if self.is_ok() || self.is_additional_frame() {
            Level::DEBUG
        } else if self.sw1 == 0x91 && self.sw2 == 0x0C {
            // No changes
            Level::INFO
        } else {
            Level::WARN
        }
    }

    /// Get a description of this status word
    pub const fn description(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x91, 0x00) | (0x90, 0x00) => "Operation ok",
            (0x91, 0x0C) => "No changes",
            (0x91, 0x0E) => "Out of EEPROM memory",
            (0x91, 0x1C) => "Illegal command code",
            (0x91, 0x1E) => "Integrity error",
            (0x91, 0x40) => "No such key",
            (0x91, 0x7E) => "Length error",
            (0x91, 0x9D) => "Permission denied",
            (0x91, 0x9E) => "Parameter error",
            (0x91, 0x97) => "Crypto error",
            (0x91, 0xA0) => "Application not found",
            (0x91, 0xA1) => "Application integrity error",
            (0x91, 0xAE) => "Authentication error",
            (0x91, 0xAF) => "Additional frame",
            (0x91, 0xBD) => "No such key",
            (0x91, 0xBE) => "Boundary error",
            (0x91, 0xC1) => "PICC integrity error",
            (0x91, 0xCA) => "Command aborted",
            (0x91, 0xCD) => "PICC disabled",
            (0x91, 0xCE) => "Count error",
            (0x91, 0xDE) => "Duplicate error",
            (0x91, 0xEE) => "EEPROM error",
            (0x91, 0xF0) => "File not found",
            (0x91, 0xF1) => "File integrity error",
            (0x67, 0x00) => "Wrong length",
            (0x6A, 0x82) => "File not found",
            (0x6D, 0x00) => "Instruction code not supported or invalid",
            (0x6E, 0x00) => "Class not supported",
            _ => "Unknown status word",
        }
    }
}

impl From<(u8, u8)> for StatusWord {
    fn from(tuple: (u8, u8)) -> Self {
        Self::new(tuple.0, tuple.1)
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.sw1, self.sw2)
    }
}
