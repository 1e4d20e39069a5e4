//! Command codes and limits for DESFire native commands

/// Native command codes
pub mod cmd {
    /// Legacy DES / 2K3DES authentication
    pub const AUTHENTICATE: u8 = 0x0A;
    /// ISO authentication for 3K3DES
    pub const AUTHENTICATE_ISO: u8 = 0x1A;
    /// Legacy AES authentication
    pub const AUTHENTICATE_AES: u8 = 0xAA;
    /// EV2 first authentication
    pub const AUTHENTICATE_EV2_FIRST: u8 = 0x71;
    /// EV2 non-first authentication
    pub const AUTHENTICATE_EV2_NON_FIRST: u8 = 0x77;
    /// Continuation frame
    pub const ADDITIONAL_FRAME: u8 = 0xAF;
    /// Select application
    pub const SELECT_APPLICATION: u8 = 0x5A;
    /// Read data from a standard or backup file
    pub const READ_DATA: u8 = 0xBD;
    /// Write data to a standard or backup file
    pub const WRITE_DATA: u8 = 0x3D;
    /// Read a value file
    pub const GET_VALUE: u8 = 0x6C;
    /// Increase a value file
    pub const CREDIT: u8 = 0x0C;
    /// Decrease a value file
    pub const DEBIT: u8 = 0xDC;
    /// Commit the current transaction
    pub const COMMIT_TRANSACTION: u8 = 0xC7;
    /// Abort the current transaction
    pub const ABORT_TRANSACTION: u8 = 0xA7;
    /// Manufacturing data
    pub const GET_VERSION: u8 = 0x60;
    /// Real UID, available after authentication
    pub const GET_CARD_UID: u8 = 0x51;
}

/// Highest key number an application can hold
pub const MAX_KEY_NO: u8 = 14;

/// AID of the PICC level
pub const PICC_AID: [u8; 3] = [0x00, 0x00, 0x00];

/// Length of the truncated EV2 MAC
pub const EV2_MAC_LEN: usize = 8;

/// Length of the CMAC carried by EV1 messages
pub const EV1_MAC_LEN: usize = 8;

/// Length of the D40 MAC
pub const LEGACY_MAC_LEN: usize = 4;

/// Length of the transaction identifier
pub const TI_LEN: usize = 4;

/// Length of a card UID
pub const UID_LEN: usize = 7;
