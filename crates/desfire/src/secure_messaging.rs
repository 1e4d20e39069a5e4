//! Secure messaging for authenticated sessions
//!
//! A [`SecureMessagingSession`] borrows an [`AuthenticationSession`] for the
//! length of one command/response pair and protects the payload according to
//! the requested [`CommunicationMode`]. The protection differs per session
//! kind:
//!
//! - EV2 sessions MAC with truncated AES-CMAC and encrypt with AES-CBC under
//!   IVs derived from the transaction identifier and command counter.
//! - D40 sessions append a CRC16 and use send/receive mode for full
//!   encryption, or a 4 byte CBC-MAC for MACed mode.
//! - EV1 sessions run a CMAC over every command and response, whatever the
//!   mode, and carry the full tag forward as IV. MACed mode sends the first
//!   eight bytes of that tag; full mode appends a CRC32 and encrypts with CBC
//!   under the same chained IV.

use derive_more::Display;
use tracing::trace;

use crate::constants::{EV1_MAC_LEN, EV2_MAC_LEN, LEGACY_MAC_LEN};
use crate::crypto::{
    aes_cmac, cbc_decrypt, cbc_encrypt, cmac_chained, crc16, crc32, legacy_mac, pad_iso9797_m2,
    pad_zero, receive_mode_transform, send_mode_transform, truncate_mac, unpad_iso9797_m2, zero_iv,
};
use crate::keys::KeyType;
use crate::session::{AuthMode, AuthenticationSession};
use crate::{Error, Result};

/// How a command payload is protected on the wire
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommunicationMode {
    /// No protection
    #[default]
    Plain,
    /// Integrity protection only
    #[display("MACed")]
    Maced,
    /// Integrity protection and encryption
    Full,
}

/// IV label for command encryption
const IV_LABEL_COMMAND: [u8; 2] = [0xA5, 0x5A];
/// IV label for response decryption
const IV_LABEL_RESPONSE: [u8; 2] = [0x5A, 0xA5];

const STEP: &str = "secure messaging";

/// Protects one command/response pair
#[derive(Debug)]
pub struct SecureMessagingSession<'a> {
    session: &'a mut AuthenticationSession,
    mode: CommunicationMode,
}

impl<'a> SecureMessagingSession<'a> {
    /// Borrow a live session for one exchange in `mode`
    pub fn new(session: &'a mut AuthenticationSession, mode: CommunicationMode) -> Result<Self> {
        if !session.is_live() {
            return Err(Error::NotAuthenticated);
        }
        Ok(Self { session, mode })
    }

    /// Communication mode of this exchange
    pub const fn mode(&self) -> CommunicationMode {
        self.mode
    }

    /// Build the parameter bytes for `command`
    ///
    /// `header` is sent in the clear in every mode; `data` is protected.
    pub fn wrap_command(&mut self, command: u8, header: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut params = header.to_vec();
        match (self.session.mode(), self.mode) {
            (AuthMode::LegacyIso | AuthMode::LegacyAes, CommunicationMode::Full)
                if !data.is_empty() =>
            {
                let key_type = self.session.key_type();
                let mut covered = vec![command];
                covered.extend_from_slice(header);
                covered.extend_from_slice(data);

                let mut plain = data.to_vec();
                plain.extend_from_slice(&crc32(&covered));
                let padded = pad_zero(&plain, key_type.block_size());

                let encrypted = cbc_encrypt(key_type, self.enc_key()?, self.session.iv(), &padded)?;
                self.chain_iv(&encrypted);
                params.extend(encrypted);
            }
            (AuthMode::LegacyIso | AuthMode::LegacyAes, mode) => {
                let mut covered = vec![command];
                covered.extend_from_slice(header);
                covered.extend_from_slice(data);
                let mac = self.ev1_cmac(&covered)?;

                params.extend_from_slice(data);
                if mode == CommunicationMode::Maced && !data.is_empty() {
                    params.extend_from_slice(&mac[..EV1_MAC_LEN]);
                }
            }
            (_, CommunicationMode::Plain) => params.extend_from_slice(data),
            (AuthMode::Ev2First | AuthMode::Ev2NonFirst, mode) => {
                let counter = self.session.command_counter();
                if counter == u16::MAX {
                    return Err(Error::Precondition("command counter exhausted"));
                }

                let protected = if mode == CommunicationMode::Full && !data.is_empty() {
                    let iv = self.ev2_iv(IV_LABEL_COMMAND, counter)?;
                    cbc_encrypt(KeyType::Aes, self.enc_key()?, &iv, &pad_iso9797_m2(data, 16))?
                } else {
                    data.to_vec()
                };

                let mut input = vec![command];
                input.extend_from_slice(&counter.to_le_bytes());
                input.extend_from_slice(&self.ti()?);
                input.extend_from_slice(header);
                input.extend_from_slice(&protected);

                params.extend_from_slice(&protected);
                params.extend_from_slice(&self.ev2_mac(&input)?);
            }
            (AuthMode::LegacyD40, CommunicationMode::Maced) => {
                params.extend_from_slice(data);
                if !data.is_empty() {
                    let key_type = self.session.key_type();
                    params.extend_from_slice(&legacy_mac(key_type, self.enc_key()?, data)?);
                }
            }
            (AuthMode::LegacyD40, CommunicationMode::Full) => {
                if !data.is_empty() {
                    let key_type = self.session.key_type();
                    let mut plain = data.to_vec();
                    plain.extend_from_slice(&crc16(data));
                    let padded = pad_zero(&plain, key_type.block_size());
                    params.extend(send_mode_transform(key_type, self.enc_key()?, &padded)?);
                }
            }
        }

        trace!(
            command = format_args!("{command:02X}"),
            mode = %self.mode,
            len = params.len(),
            "Wrapped command"
        );
        Ok(params)
    }

    /// Verify and strip protection from a response payload
    ///
    /// `expected_len` is the plain length when the caller knows it; D40 and
    /// EV1 full mode use it to locate the CRC. `Some(0)` marks a command that
    /// returns no data, which an EV1 card answers with a CMAC in every mode.
    pub fn unwrap_response(
        &mut self,
        payload: &[u8],
        expected_len: Option<usize>,
    ) -> Result<Vec<u8>> {
        let data = match (self.session.mode(), self.mode) {
            (AuthMode::Ev2First | AuthMode::Ev2NonFirst, mode) => {
                let next = self
                    .session
                    .command_counter()
                    .checked_add(1)
                    .ok_or(Error::Precondition("command counter exhausted"))?;

                let data = if mode == CommunicationMode::Plain {
                    payload.to_vec()
                } else {
                    self.ev2_unwrap(payload, next, expected_len)?
                };
                self.session.set_command_counter(next);
                data
            }
            (AuthMode::LegacyIso | AuthMode::LegacyAes, CommunicationMode::Full)
                if expected_len != Some(0) =>
            {
                if payload.is_empty() {
                    return Ok(Vec::new());
                }
                let key_type = self.session.key_type();
                let plain = cbc_decrypt(key_type, self.enc_key()?, self.session.iv(), payload)?;
                self.chain_iv(payload);
                strip_crc(&plain, expected_len, key_type.block_size(), |data| {
                    let mut covered = data.to_vec();
                    covered.push(0x00);
                    crc32(&covered)
                })?
            }
            (AuthMode::LegacyIso | AuthMode::LegacyAes, _) => {
                let split = payload
                    .len()
                    .checked_sub(EV1_MAC_LEN)
                    .ok_or(Error::malformed(STEP, "response shorter than MAC"))?;
                let (data, mac) = payload.split_at(split);

                // The tag covers the data and the 00 status byte
                let mut covered = data.to_vec();
                covered.push(0x00);
                if self.ev1_cmac(&covered)?[..EV1_MAC_LEN] != *mac {
                    return Err(Error::IntegrityCheck("response MAC mismatch"));
                }
                data.to_vec()
            }
            (_, CommunicationMode::Plain) => payload.to_vec(),
            (AuthMode::LegacyD40, CommunicationMode::Maced) => {
                if payload.is_empty() {
                    return Ok(Vec::new());
                }
                let split = payload
                    .len()
                    .checked_sub(LEGACY_MAC_LEN)
                    .ok_or(Error::malformed(STEP, "response shorter than MAC"))?;
                let (data, mac) = payload.split_at(split);
                let expected = legacy_mac(self.session.key_type(), self.enc_key()?, data)?;
                if expected != mac {
                    return Err(Error::IntegrityCheck("response MAC mismatch"));
                }
                data.to_vec()
            }
            (AuthMode::LegacyD40, CommunicationMode::Full) => {
                if payload.is_empty() {
                    return Ok(Vec::new());
                }
                let key_type = self.session.key_type();
                let plain = receive_mode_transform(key_type, self.enc_key()?, payload)?;
                strip_crc(&plain, expected_len, key_type.block_size(), crc16)?
            }
        };

        trace!(mode = %self.mode, len = data.len(), "Unwrapped response");
        Ok(data)
    }

    fn ev2_unwrap(
        &self,
        payload: &[u8],
        counter: u16,
        expected_len: Option<usize>,
    ) -> Result<Vec<u8>> {
        let split = payload
            .len()
            .checked_sub(EV2_MAC_LEN)
            .ok_or(Error::malformed(STEP, "response shorter than MAC"))?;
        let (body, mac) = payload.split_at(split);

        let mut input = vec![0x00];
        input.extend_from_slice(&counter.to_le_bytes());
        input.extend_from_slice(&self.ti()?);
        input.extend_from_slice(body);
        if self.ev2_mac(&input)? != mac {
            return Err(Error::IntegrityCheck("response MAC mismatch"));
        }

        if self.mode == CommunicationMode::Maced || body.is_empty() {
            return Ok(body.to_vec());
        }

        let iv = self.ev2_iv(IV_LABEL_RESPONSE, counter)?;
        let plain = cbc_decrypt(KeyType::Aes, self.enc_key()?, &iv, body)?;
        let data = unpad_iso9797_m2(&plain, 16)?;
        if expected_len.is_some_and(|len| len != data.len()) {
            return Err(Error::malformed(STEP, "unexpected response length"));
        }
        Ok(data.to_vec())
    }

    fn ev2_iv(&self, label: [u8; 2], counter: u16) -> Result<Vec<u8>> {
        let mut block = [0u8; 16];
        block[0..2].copy_from_slice(&label);
        block[2..6].copy_from_slice(&self.ti()?);
        block[6..8].copy_from_slice(&counter.to_le_bytes());
        cbc_encrypt(KeyType::Aes, self.enc_key()?, &zero_iv(KeyType::Aes), &block)
    }

    fn ev2_mac(&self, input: &[u8]) -> Result<[u8; EV2_MAC_LEN]> {
        let key = self.session.mac_key().ok_or(Error::NotAuthenticated)?;
        Ok(truncate_mac(&aes_cmac(key, input)?))
    }

    /// CMAC under the session key, chained through the session IV
    fn ev1_cmac(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let key_type = self.session.key_type();
        let mac = cmac_chained(key_type, self.enc_key()?, self.session.iv(), message)?;
        self.session.set_iv(&mac);
        Ok(mac)
    }

    fn enc_key(&self) -> Result<&[u8]> {
        self.session.enc_key().ok_or(Error::NotAuthenticated)
    }

    fn ti(&self) -> Result<[u8; 4]> {
        self.session
            .transaction_identifier()
            .ok_or(Error::Precondition("missing transaction identifier"))
    }

    fn chain_iv(&mut self, ciphertext: &[u8]) {
        let block_size = self.session.key_type().block_size();
        if let Some(last) = ciphertext.len().checked_sub(block_size) {
            self.session.set_iv(&ciphertext[last..]);
        }
    }
}

/// Locate and verify a trailing CRC followed by zero padding
///
/// With no expected length, every split inside the last block is tried from
/// the shortest candidate up. Neither CRC has a final XOR, so a longer split
/// that swallows the real CRC plus zero padding would also verify.
fn strip_crc<const N: usize>(
    plain: &[u8],
    expected_len: Option<usize>,
    block_size: usize,
    crc: impl Fn(&[u8]) -> [u8; N],
) -> Result<Vec<u8>> {
    let fits = |len: usize| {
        let end = len + N;
        end <= plain.len()
            && plain[end..].iter().all(|&b| b == 0x00)
            && crc(&plain[..len]) == plain[len..end]
    };

    let found = match expected_len {
        Some(len) => fits(len).then_some(len),
        None => plain.len().checked_sub(N).and_then(|longest| {
            let shortest = longest.saturating_sub(block_size - 1);
            (shortest..=longest).find(|&len| fits(len))
        }),
    };

    found
        .map(|len| plain[..len].to_vec())
        .ok_or(Error::IntegrityCheck("CRC mismatch"))
}
