//! Simulated PICC for end to end tests
//!
//! The card side of every handshake and of secure messaging is written out
//! with the crypto primitives directly, so host and card only share the
//! cipher and KDF building blocks.

use std::collections::{BTreeMap, VecDeque};

use desfire_apdu_core::{Bytes, CardTransport, TransportError};
use hex_literal::hex;
use rand::{CryptoRng, RngCore};

use crate::constants::{PICC_AID, cmd};
use crate::crypto::{
    aes_cmac, cbc_decrypt, cbc_encrypt, cmac_chained, crc16, crc32, legacy_mac, pad_iso9797_m2,
    pad_zero, rotate_left, truncate_mac, unpad_iso9797_m2, xor, zero_iv,
};
use crate::kdf::{ev2_session_keys, legacy_session_key};
use crate::keys::{KeyMaterial, KeyType};
use crate::secure_messaging::CommunicationMode;
use crate::session::{AuthMode, Capabilities};

/// Deterministic RNG for reproducible challenges
#[derive(Debug, Clone)]
pub(crate) struct FixedRng {
    next: u8,
}

impl FixedRng {
    pub(crate) const fn new(seed: u8) -> Self {
        Self { next: seed }
    }
}

impl RngCore for FixedRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest {
            *byte = self.next;
            self.next = self.next.wrapping_mul(5).wrapping_add(0x3B);
        }
    }
}

impl CryptoRng for FixedRng {}

const OK: u8 = 0x00;
const ILLEGAL_COMMAND: u8 = 0x1C;
const INTEGRITY_ERROR: u8 = 0x1E;
const NO_SUCH_KEY: u8 = 0x40;
const LENGTH_ERROR: u8 = 0x7E;
const APPLICATION_NOT_FOUND: u8 = 0xA0;
const AUTHENTICATION_ERROR: u8 = 0xAE;
const MORE_FRAMES: u8 = 0xAF;
const BOUNDARY_ERROR: u8 = 0xBE;
const FILE_NOT_FOUND: u8 = 0xF0;

/// Largest response payload per frame
const FRAME_PAYLOAD: usize = 59;

const KNOWN_AIDS: [[u8; 3]; 2] = [PICC_AID, [0x56, 0x34, 0x12]];

const TI: [u8; 4] = hex!("9D00C4DF");
const PD_CAP2: [u8; 6] = hex!("020000000000");
const PCD_CAP2: [u8; 6] = hex!("000000000000");

const HARDWARE_VERSION: [u8; 7] = hex!("04010112001A05");
const SOFTWARE_VERSION: [u8; 7] = hex!("04010102001A05");
const BATCH: [u8; 5] = hex!("BA654A0D41");

type CardResult<T> = Result<T, u8>;

#[derive(Debug)]
struct CardSession {
    mode: AuthMode,
    key_type: KeyType,
    enc: Vec<u8>,
    mac: Option<Vec<u8>>,
    counter: u16,
    ti: Option<[u8; 4]>,
    iv: Vec<u8>,
}

#[derive(Debug)]
struct PendingAuth {
    command: u8,
    key: KeyMaterial,
    rnd_b: Vec<u8>,
    ek_rnd_b: Vec<u8>,
    transaction: Option<([u8; 4], u16)>,
}

#[derive(Debug)]
struct PendingCommand {
    command: u8,
    params: Vec<u8>,
    expected: usize,
}

#[derive(Debug)]
struct ValueFile {
    mode: CommunicationMode,
    committed: i32,
    pending: i32,
}

/// A card with one application, driven through [`CardTransport`]
#[derive(Debug)]
pub(crate) struct SimulatedPicc {
    keys: BTreeMap<u8, KeyMaterial>,
    files: BTreeMap<u8, (CommunicationMode, Vec<u8>)>,
    values: BTreeMap<u8, ValueFile>,
    session: Option<CardSession>,
    auth: Option<PendingAuth>,
    incoming: Option<PendingCommand>,
    outgoing: VecDeque<Vec<u8>>,
    commands: Vec<Vec<u8>>,
    /// Flip a byte of the handshake proof
    pub(crate) corrupt_proof: bool,
    /// Flip the last byte of every secured response
    pub(crate) tamper_response: bool,
    /// Fail the next transmission
    pub(crate) fail_next: Option<TransportError>,
}

impl SimulatedPicc {
    pub(crate) const UID: [u8; 7] = hex!("04112233445566");

    /// Card whose key 0 is `key`
    pub(crate) fn new(key: KeyMaterial) -> Self {
        Self {
            keys: BTreeMap::from([(0, key)]),
            files: BTreeMap::new(),
            values: BTreeMap::new(),
            session: None,
            auth: None,
            incoming: None,
            outgoing: VecDeque::new(),
            commands: Vec::new(),
            corrupt_proof: false,
            tamper_response: false,
            fail_next: None,
        }
    }

    pub(crate) fn with_key(mut self, key_no: u8, key: KeyMaterial) -> Self {
        self.keys.insert(key_no, key);
        self
    }

    pub(crate) fn with_file(mut self, file_no: u8, mode: CommunicationMode, data: Vec<u8>) -> Self {
        self.files.insert(file_no, (mode, data));
        self
    }

    pub(crate) fn with_value(mut self, file_no: u8, mode: CommunicationMode, value: i32) -> Self {
        self.values.insert(
            file_no,
            ValueFile {
                mode,
                committed: value,
                pending: value,
            },
        );
        self
    }

    pub(crate) fn commands(&self) -> &[Vec<u8>] {
        &self.commands
    }

    pub(crate) fn file(&self, file_no: u8) -> Option<&[u8]> {
        self.files.get(&file_no).map(|(_, data)| data.as_slice())
    }

    pub(crate) fn session_key(&self) -> Option<Vec<u8>> {
        self.session.as_ref().map(|session| session.enc.clone())
    }

    pub(crate) fn mac_key(&self) -> Option<Vec<u8>> {
        self.session.as_ref().and_then(|session| session.mac.clone())
    }

    pub(crate) fn iv(&self) -> Option<&[u8]> {
        self.session.as_ref().map(|session| session.iv.as_slice())
    }

    pub(crate) fn command_counter(&self) -> Option<u16> {
        self.session.as_ref().map(|session| session.counter)
    }

    pub(crate) fn set_command_counter(&mut self, counter: u16) {
        if let Some(session) = self.session.as_mut() {
            session.counter = counter;
        }
    }

    pub(crate) const fn transaction_identifier(&self) -> [u8; 4] {
        TI
    }

    pub(crate) const fn capabilities(&self) -> Capabilities {
        Capabilities {
            pd_cap2: PD_CAP2,
            pcd_cap2: PCD_CAP2,
        }
    }

    fn process(&mut self, command: u8, params: &[u8]) -> Vec<u8> {
        if command == cmd::ADDITIONAL_FRAME {
            if let Some(auth) = self.auth.take() {
                return self.finish_auth(auth, params).unwrap_or_else(|sw| self.fail(sw));
            }
            if let Some(frame) = self.outgoing.pop_front() {
                return frame;
            }
            if let Some(mut pending) = self.incoming.take() {
                pending.params.extend_from_slice(params);
                return self.accumulate(pending);
            }
            return self.fail(ILLEGAL_COMMAND);
        }

        self.auth = None;
        self.incoming = None;
        self.outgoing.clear();

        match command {
            cmd::AUTHENTICATE
            | cmd::AUTHENTICATE_ISO
            | cmd::AUTHENTICATE_AES
            | cmd::AUTHENTICATE_EV2_FIRST
            | cmd::AUTHENTICATE_EV2_NON_FIRST => {
                self.start_auth(command, params).unwrap_or_else(|sw| self.fail(sw))
            }
            cmd::GET_VERSION => self.version(),
            _ => {
                let expected = self.expected_params_len(command, params);
                self.accumulate(PendingCommand {
                    command,
                    params: params.to_vec(),
                    expected,
                })
            }
        }
    }

    fn accumulate(&mut self, pending: PendingCommand) -> Vec<u8> {
        if pending.params.len() < pending.expected {
            self.incoming = Some(pending);
            return vec![0x91, MORE_FRAMES];
        }
        match self.execute(pending.command, &pending.params) {
            Ok(payload) => self.respond(payload),
            Err(sw) => self.fail(sw),
        }
    }

    fn fail(&mut self, sw: u8) -> Vec<u8> {
        self.session = None;
        vec![0x91, sw]
    }

    fn respond(&mut self, payload: Vec<u8>) -> Vec<u8> {
        let mut frames: Vec<Vec<u8>> = payload.chunks(FRAME_PAYLOAD).map(<[u8]>::to_vec).collect();
        if frames.is_empty() {
            frames.push(Vec::new());
        }
        let last = frames.len() - 1;
        for (index, frame) in frames.iter_mut().enumerate() {
            frame.extend_from_slice(&[0x91, if index == last { OK } else { MORE_FRAMES }]);
        }
        let first = frames.remove(0);
        self.outgoing.extend(frames);
        first
    }

    /// Hardware, software and production data in three frames
    fn version(&mut self) -> Vec<u8> {
        let production = [Self::UID.as_slice(), &BATCH, &[0x10, 0x21]].concat();
        let mut last = production.clone();
        if let Some(session) = self.session.as_mut() {
            if session.mode.is_ev2() {
                session.counter += 1;
            } else if session.mode.is_ev1() {
                session.cmac(&[cmd::GET_VERSION]);
                let all = [
                    HARDWARE_VERSION.as_slice(),
                    &SOFTWARE_VERSION,
                    production.as_slice(),
                    &[OK],
                ]
                .concat();
                last.extend_from_slice(&session.cmac(&all)[..8]);
            }
        }
        self.outgoing
            .push_back([SOFTWARE_VERSION.as_slice(), &[0x91, MORE_FRAMES]].concat());
        self.outgoing.push_back([last.as_slice(), &[0x91, OK]].concat());
        [HARDWARE_VERSION.as_slice(), &[0x91, MORE_FRAMES]].concat()
    }

    fn start_auth(&mut self, command: u8, params: &[u8]) -> CardResult<Vec<u8>> {
        let key_no = *params.first().ok_or(LENGTH_ERROR)?;
        let key = self.keys.get(&key_no).ok_or(NO_SUCH_KEY)?.with_version(0);

        let fits = match command {
            cmd::AUTHENTICATE => matches!(key.key_type(), KeyType::Des | KeyType::Tdes),
            cmd::AUTHENTICATE_ISO => key.key_type() == KeyType::Tktdes,
            _ => key.key_type() == KeyType::Aes,
        };
        if !fits {
            return Err(AUTHENTICATION_ERROR);
        }

        let transaction = if command == cmd::AUTHENTICATE_EV2_NON_FIRST {
            let session = self.session.as_ref().filter(|s| s.mode.is_ev2());
            let ti = session.and_then(|s| s.ti).ok_or(AUTHENTICATION_ERROR)?;
            session.map(|s| (ti, s.counter))
        } else {
            None
        };
        self.session = None;

        let len = key.key_type().challenge_len();
        let rnd_b: Vec<u8> = (0..len).map(|i| 0xB0 ^ (i as u8).wrapping_mul(0x1D)).collect();
        let ek_rnd_b = encrypt(key.key_type(), key.as_bytes(), &zero_iv(key.key_type()), &rnd_b);

        let mut response = ek_rnd_b.clone();
        response.extend_from_slice(&[0x91, MORE_FRAMES]);
        self.auth = Some(PendingAuth {
            command,
            key,
            rnd_b,
            ek_rnd_b,
            transaction,
        });
        Ok(response)
    }

    fn finish_auth(&mut self, auth: PendingAuth, token: &[u8]) -> CardResult<Vec<u8>> {
        let key_type = auth.key.key_type();
        let key = auth.key.as_bytes();
        let len = key_type.challenge_len();
        let block_size = key_type.block_size();
        if token.len() != 2 * len {
            return Err(LENGTH_ERROR);
        }

        let plain = match auth.command {
            cmd::AUTHENTICATE => undo_send_mode(key_type, key, token),
            cmd::AUTHENTICATE_ISO | cmd::AUTHENTICATE_AES => {
                decrypt(key_type, key, tail(&auth.ek_rnd_b, block_size), token)
            }
            _ => decrypt(key_type, key, &zero_iv(key_type), token),
        };
        let (rnd_a, rotated_b) = plain.split_at(len);
        if rotated_b != rotate_left(&auth.rnd_b).as_slice() {
            return Err(AUTHENTICATION_ERROR);
        }

        let mut proof = rotate_left(rnd_a);
        if self.corrupt_proof {
            proof[0] ^= 0x01;
        }

        let zero = zero_iv(key_type);
        let (reply, session) = match auth.command {
            cmd::AUTHENTICATE => {
                let enc = if key_type == KeyType::Tdes && key[..8] == key[8..] {
                    let single = legacy_session_key(KeyType::Des, rnd_a, &auth.rnd_b).unwrap();
                    [single.clone(), single].concat()
                } else {
                    legacy_session_key(key_type, rnd_a, &auth.rnd_b).unwrap()
                };
                (
                    encrypt(key_type, key, &zero, &proof),
                    CardSession::legacy(AuthMode::LegacyD40, key_type, enc),
                )
            }
            cmd::AUTHENTICATE_ISO | cmd::AUTHENTICATE_AES => {
                let mode = if auth.command == cmd::AUTHENTICATE_ISO {
                    AuthMode::LegacyIso
                } else {
                    AuthMode::LegacyAes
                };
                let enc = legacy_session_key(key_type, rnd_a, &auth.rnd_b).unwrap();
                (
                    encrypt(key_type, key, tail(token, block_size), &proof),
                    CardSession::legacy(mode, key_type, enc),
                )
            }
            command => {
                let rnd_a: [u8; 16] = rnd_a.try_into().unwrap();
                let rnd_b: [u8; 16] = auth.rnd_b.as_slice().try_into().unwrap();
                let (enc, mac) = ev2_session_keys(key, &rnd_a, &rnd_b).unwrap();

                let (mode, ti, counter, body) = if command == cmd::AUTHENTICATE_EV2_FIRST {
                    let body = [TI.as_slice(), &proof, &PD_CAP2, &PCD_CAP2].concat();
                    (AuthMode::Ev2First, TI, 0, body)
                } else {
                    let (ti, counter) = auth.transaction.ok_or(AUTHENTICATION_ERROR)?;
                    (AuthMode::Ev2NonFirst, ti, counter, proof)
                };
                let session = CardSession {
                    mode,
                    key_type,
                    enc: enc.to_vec(),
                    mac: Some(mac.to_vec()),
                    counter,
                    ti: Some(ti),
                    iv: vec![0; 16],
                };
                (encrypt(key_type, key, &zero, &body), session)
            }
        };

        self.session = Some(session);
        let mut response = reply;
        response.extend_from_slice(&[0x91, OK]);
        Ok(response)
    }

    /// Total parameter length of a command that may arrive in several frames
    fn expected_params_len(&self, command: u8, params: &[u8]) -> usize {
        if command != cmd::WRITE_DATA || params.len() < 7 {
            return params.len();
        }
        let len = u24(&params[4..7]);
        let mode = self.files.get(&params[0]).map_or(CommunicationMode::Plain, |f| f.0);
        7 + self.protected_len(mode, len)
    }

    fn protected_len(&self, mode: CommunicationMode, len: usize) -> usize {
        let Some(session) = &self.session else {
            return len;
        };
        let block_size = session.key_type.block_size();
        match (session.mode, mode) {
            (_, CommunicationMode::Plain) => len,
            (m, CommunicationMode::Maced) if m.is_ev2() => len + 8,
            (m, CommunicationMode::Full) if m.is_ev2() => (len / 16 + 1) * 16 + 8,
            (AuthMode::LegacyD40, CommunicationMode::Maced) => len + 4,
            (AuthMode::LegacyD40, CommunicationMode::Full) => (len + 2).next_multiple_of(block_size),
            (_, CommunicationMode::Full) => (len + 4).next_multiple_of(block_size),
            (_, CommunicationMode::Maced) => len + 8,
        }
    }

    fn execute(&mut self, command: u8, params: &[u8]) -> CardResult<Vec<u8>> {
        match command {
            cmd::SELECT_APPLICATION => {
                self.session = None;
                let aid: [u8; 3] = params.try_into().map_err(|_| LENGTH_ERROR)?;
                if !KNOWN_AIDS.contains(&aid) {
                    return Err(APPLICATION_NOT_FOUND);
                }
                Ok(Vec::new())
            }
            cmd::READ_DATA => {
                let header = params.get(..7).ok_or(LENGTH_ERROR)?;
                let (mode, contents) = self.files.get(&header[0]).ok_or(FILE_NOT_FOUND)?;
                let (mode, contents) = (*mode, contents.clone());
                self.open_command(command, header, &params[7..], mode, 0)?;

                let offset = u24(&header[1..4]);
                let length = match u24(&header[4..7]) {
                    0 => contents.len().checked_sub(offset).ok_or(BOUNDARY_ERROR)?,
                    n => n,
                };
                let data = contents.get(offset..offset + length).ok_or(BOUNDARY_ERROR)?;
                self.seal_response(data, mode)
            }
            cmd::WRITE_DATA => {
                let header = params.get(..7).ok_or(LENGTH_ERROR)?;
                let mode = self.files.get(&header[0]).ok_or(FILE_NOT_FOUND)?.0;
                let length = u24(&header[4..7]);
                let data = self.open_command(command, header, &params[7..], mode, length)?;
                if data.len() != length {
                    return Err(LENGTH_ERROR);
                }

                let offset = u24(&header[1..4]);
                let (_, contents) = self.files.get_mut(&header[0]).ok_or(FILE_NOT_FOUND)?;
                contents
                    .get_mut(offset..offset + length)
                    .ok_or(BOUNDARY_ERROR)?
                    .copy_from_slice(&data);
                self.seal_response(&[], mode)
            }
            cmd::GET_VALUE => {
                let file_no = *params.first().ok_or(LENGTH_ERROR)?;
                let (mode, value) = self
                    .values
                    .get(&file_no)
                    .map(|v| (v.mode, v.committed))
                    .ok_or(FILE_NOT_FOUND)?;
                self.open_command(command, &params[..1], &params[1..], mode, 0)?;
                self.seal_response(&value.to_le_bytes(), mode)
            }
            cmd::CREDIT | cmd::DEBIT => {
                let file_no = *params.first().ok_or(LENGTH_ERROR)?;
                let mode = self.values.get(&file_no).ok_or(FILE_NOT_FOUND)?.mode;
                let data = self.open_command(command, &params[..1], &params[1..], mode, 4)?;
                let amount = i32::from_le_bytes(data.as_slice().try_into().map_err(|_| LENGTH_ERROR)?);

                let value = self.values.get_mut(&file_no).ok_or(FILE_NOT_FOUND)?;
                if command == cmd::CREDIT {
                    value.pending += amount;
                } else {
                    value.pending -= amount;
                }
                self.seal_response(&[], mode)
            }
            cmd::COMMIT_TRANSACTION | cmd::ABORT_TRANSACTION => {
                let mode = if self.session.as_ref().is_some_and(|s| s.mode.is_ev2()) {
                    CommunicationMode::Maced
                } else {
                    CommunicationMode::Plain
                };
                self.open_command(command, &[], params, mode, 0)?;
                for value in self.values.values_mut() {
                    if command == cmd::COMMIT_TRANSACTION {
                        value.committed = value.pending;
                    } else {
                        value.pending = value.committed;
                    }
                }
                self.seal_response(&[], mode)
            }
            cmd::GET_CARD_UID => {
                let session = self.session.as_ref().ok_or(AUTHENTICATION_ERROR)?;
                if session.mode == AuthMode::LegacyD40 {
                    return Err(ILLEGAL_COMMAND);
                }
                self.open_command(command, &[], params, CommunicationMode::Full, 0)?;
                self.seal_response(&Self::UID, CommunicationMode::Full)
            }
            _ => Err(ILLEGAL_COMMAND),
        }
    }

    /// Verify and decrypt the protected part of a command
    fn open_command(
        &mut self,
        command: u8,
        header: &[u8],
        body: &[u8],
        mode: CommunicationMode,
        plain_len: usize,
    ) -> CardResult<Vec<u8>> {
        let Some(session) = self.session.as_mut() else {
            if mode != CommunicationMode::Plain {
                return Err(AUTHENTICATION_ERROR);
            }
            return Ok(body.to_vec());
        };
        if mode == CommunicationMode::Plain && !session.mode.is_ev1() {
            return Ok(body.to_vec());
        }

        let key_type = session.key_type;
        let block_size = key_type.block_size();
        match session.mode {
            AuthMode::Ev2First | AuthMode::Ev2NonFirst => {
                let split = body.len().checked_sub(8).ok_or(LENGTH_ERROR)?;
                let (protected, mac) = body.split_at(split);
                let ti = session.ti.ok_or(AUTHENTICATION_ERROR)?;

                let input = [
                    &[command][..],
                    &session.counter.to_le_bytes(),
                    &ti,
                    header,
                    protected,
                ]
                .concat();
                if ev2_mac(session, &input) != mac {
                    return Err(INTEGRITY_ERROR);
                }
                if mode == CommunicationMode::Maced || protected.is_empty() {
                    return Ok(protected.to_vec());
                }

                let iv = ev2_iv(session, [0xA5, 0x5A], session.counter);
                let plain = decrypt(KeyType::Aes, &session.enc, &iv, protected);
                let data = unpad_iso9797_m2(&plain, 16).map_err(|_| INTEGRITY_ERROR)?;
                Ok(data.to_vec())
            }
            AuthMode::LegacyIso | AuthMode::LegacyAes
                if mode == CommunicationMode::Full && !body.is_empty() =>
            {
                let plain = decrypt(key_type, &session.enc, &session.iv, body);
                session.iv = tail(body, block_size).to_vec();

                let (data, rest) = plain.split_at(plain_len.min(plain.len()));
                let covered = [&[command][..], header, data].concat();
                if rest.get(..4) != Some(crc32(&covered).as_slice()) {
                    return Err(INTEGRITY_ERROR);
                }
                Ok(data.to_vec())
            }
            AuthMode::LegacyIso | AuthMode::LegacyAes => {
                let (data, mac) = if mode == CommunicationMode::Maced && !body.is_empty() {
                    body.split_at(body.len().checked_sub(8).ok_or(LENGTH_ERROR)?)
                } else {
                    (body, &[][..])
                };
                let expected = session.cmac(&[&[command][..], header, data].concat());
                if !mac.is_empty() && expected[..8] != *mac {
                    return Err(INTEGRITY_ERROR);
                }
                Ok(data.to_vec())
            }
            _ if body.is_empty() => Ok(Vec::new()),
            AuthMode::LegacyD40 if mode == CommunicationMode::Maced => {
                let split = body.len().checked_sub(4).ok_or(LENGTH_ERROR)?;
                let (data, mac) = body.split_at(split);
                if legacy_mac(key_type, &session.enc, data).unwrap() != mac {
                    return Err(INTEGRITY_ERROR);
                }
                Ok(data.to_vec())
            }
            AuthMode::LegacyD40 => {
                let plain = undo_send_mode(key_type, &session.enc, body);
                let (data, rest) = plain.split_at(plain_len.min(plain.len()));
                if rest.get(..2) != Some(crc16(data).as_slice()) {
                    return Err(INTEGRITY_ERROR);
                }
                Ok(data.to_vec())
            }
        }
    }

    /// Protect response data for the active session
    fn seal_response(&mut self, data: &[u8], mode: CommunicationMode) -> CardResult<Vec<u8>> {
        let tamper = self.tamper_response;
        let Some(session) = self.session.as_mut() else {
            return Ok(data.to_vec());
        };

        let key_type = session.key_type;
        let block_size = key_type.block_size();
        let mut payload = match (session.mode, mode) {
            (AuthMode::Ev2First | AuthMode::Ev2NonFirst, mode) => {
                session.counter += 1;
                if mode == CommunicationMode::Plain {
                    return Ok(data.to_vec());
                }
                let ti = session.ti.ok_or(AUTHENTICATION_ERROR)?;
                let mut body = data.to_vec();
                if mode == CommunicationMode::Full && !data.is_empty() {
                    let iv = ev2_iv(session, [0x5A, 0xA5], session.counter);
                    body = encrypt(KeyType::Aes, &session.enc, &iv, &pad_iso9797_m2(data, 16));
                }
                let input = [&[0x00][..], &session.counter.to_le_bytes(), &ti, &body].concat();
                let mac = ev2_mac(session, &input);
                body.extend_from_slice(&mac);
                body
            }
            (AuthMode::LegacyIso | AuthMode::LegacyAes, CommunicationMode::Full)
                if !data.is_empty() =>
            {
                let covered = [data, &[0x00]].concat();
                let plain = pad_zero(&[data, &crc32(&covered)].concat(), block_size);
                let encrypted = encrypt(key_type, &session.enc, &session.iv, &plain);
                session.iv = tail(&encrypted, block_size).to_vec();
                encrypted
            }
            (AuthMode::LegacyIso | AuthMode::LegacyAes, _) => {
                let mac = session.cmac(&[data, &[OK]].concat());
                [data, &mac[..8]].concat()
            }
            (_, CommunicationMode::Plain) => return Ok(data.to_vec()),
            _ if data.is_empty() => return Ok(Vec::new()),
            (AuthMode::LegacyD40, CommunicationMode::Maced) => {
                let mac = legacy_mac(key_type, &session.enc, data).unwrap();
                [data, &mac].concat()
            }
            (AuthMode::LegacyD40, _) => {
                let plain = pad_zero(&[data, &crc16(data)].concat(), block_size);
                encrypt(key_type, &session.enc, &zero_iv(key_type), &plain)
            }
        };

        if tamper {
            if let Some(last) = payload.last_mut() {
                *last ^= 0x01;
            }
        }
        Ok(payload)
    }
}

impl CardSession {
    fn legacy(mode: AuthMode, key_type: KeyType, enc: Vec<u8>) -> Self {
        Self {
            mode,
            key_type,
            enc,
            mac: None,
            counter: 0,
            ti: None,
            iv: zero_iv(key_type),
        }
    }

    /// EV1 CMAC chained through the session IV
    fn cmac(&mut self, message: &[u8]) -> Vec<u8> {
        let mac = cmac_chained(self.key_type, &self.enc, &self.iv, message).unwrap();
        self.iv = mac.clone();
        mac
    }
}

impl CardTransport for SimulatedPicc {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        self.commands.push(command.to_vec());

        let code = command[1];
        let params = if command.len() > 5 {
            &command[5..5 + usize::from(command[4])]
        } else {
            &[][..]
        };
        Ok(Bytes::from(self.process(code, params)))
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.session = None;
        Ok(())
    }
}

fn encrypt(key_type: KeyType, key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
    cbc_encrypt(key_type, key, iv, data).unwrap()
}

fn decrypt(key_type: KeyType, key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
    cbc_decrypt(key_type, key, iv, data).unwrap()
}

/// Card side inverse of send mode: encrypt each block, then XOR with the
/// previous received block
fn undo_send_mode(key_type: KeyType, key: &[u8], data: &[u8]) -> Vec<u8> {
    let zero = zero_iv(key_type);
    let mut previous = zero.clone();
    let mut plain = Vec::with_capacity(data.len());
    for block in data.chunks(key_type.block_size()) {
        plain.extend(xor(&encrypt(key_type, key, &zero, block), &previous));
        previous = block.to_vec();
    }
    plain
}

fn ev2_iv(session: &CardSession, label: [u8; 2], counter: u16) -> Vec<u8> {
    let ti = session.ti.unwrap_or_default();
    let block = [&label[..], &ti, &counter.to_le_bytes(), &[0u8; 8]].concat();
    encrypt(KeyType::Aes, &session.enc, &[0; 16], &block)
}

fn ev2_mac(session: &CardSession, input: &[u8]) -> [u8; 8] {
    let key = session.mac.as_deref().unwrap_or_default();
    truncate_mac(&aes_cmac(key, input).unwrap())
}

fn tail(data: &[u8], block_size: usize) -> &[u8] {
    &data[data.len() - block_size..]
}

fn u24(bytes: &[u8]) -> usize {
    usize::from(bytes[0]) | (usize::from(bytes[1]) << 8) | (usize::from(bytes[2]) << 16)
}
