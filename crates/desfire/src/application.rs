//! High level DESFire client
//!
//! [`Desfire`] owns the transport, the framer and the authentication state
//! and exposes the file and value commands. Secured commands run through a
//! [`SecureMessagingSession`] built from the current session; any failure
//! after a command has started on the wire ends that session.

use desfire_apdu_core::{Bytes, CardTransport, Framer, FramerConfig};
use derive_more::Display;
use rand::rngs::ThreadRng;
use rand::{CryptoRng, RngCore};
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthOutcome, Ev2Authenticator, LegacyAuthenticator};
use crate::constants::{UID_LEN, cmd};
use crate::keys::KeyMaterial;
use crate::secure_messaging::{CommunicationMode, SecureMessagingSession};
use crate::session::{AuthMode, AuthenticationSession, SessionDiagnostics};
use crate::{Error, Result};

/// Outcome of an authentication through [`Desfire`]
pub type AuthResult = AuthOutcome<SessionDiagnostics>;

/// Highest standard file number
const MAX_FILE_NO: u8 = 0x1F;

/// Offsets and lengths are sent as three bytes
const MAX_24BIT: u32 = 0x00FF_FFFF;

/// Minimum GetVersion payload: hardware, software and production data
const VERSION_LEN: usize = 28;

/// DESFire client bound to one card
#[derive(Debug)]
pub struct Desfire<T, R = ThreadRng> {
    transport: T,
    framer: Framer,
    rng: R,
    session: Option<AuthenticationSession>,
}

impl<T: CardTransport> Desfire<T> {
    /// Create a client drawing challenges from the thread-local RNG
    pub fn new(transport: T) -> Self {
        Self::with_rng(transport, rand::rng())
    }
}

impl<T, R> Desfire<T, R>
where
    T: CardTransport,
    R: RngCore + CryptoRng,
{
    /// Create a client with an explicit RNG
    pub fn with_rng(transport: T, rng: R) -> Self {
        Self {
            transport,
            framer: Framer::default(),
            rng,
            session: None,
        }
    }

    /// Replace the framing configuration
    pub fn with_config(mut self, config: FramerConfig) -> Self {
        self.framer = Framer::new(config);
        self
    }

    /// Current session, live or invalidated
    pub const fn session(&self) -> Option<&AuthenticationSession> {
        self.session.as_ref()
    }

    /// Loggable view of the current session
    pub fn diagnostics(&self) -> Option<SessionDiagnostics> {
        self.session.as_ref().map(AuthenticationSession::diagnostics)
    }

    /// Underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Give back the transport, dropping any session
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Select an application by AID (least significant byte first)
    ///
    /// The current session ends before the command is sent, whatever the
    /// card answers.
    #[instrument(level = "debug", skip(self, aid), fields(aid = %hex::encode(aid)))]
    pub fn select_application(&mut self, aid: [u8; 3]) -> Result<()> {
        self.end_session();
        self.secured(cmd::SELECT_APPLICATION, &aid, &[], CommunicationMode::Plain, None)?;
        info!("Selected application");
        Ok(())
    }

    /// D40 or EV1 authentication, picking the command from the key type
    pub fn authenticate_legacy(&mut self, key_no: u8, key: &KeyMaterial) -> Result<AuthResult> {
        self.end_session();
        let mut auth = LegacyAuthenticator::new(self.framer, &mut self.rng);
        let outcome = auth.authenticate(&mut self.transport, key_no, key)?;
        Ok(self.install(outcome))
    }

    /// EV2 first authentication, opening a new transaction
    pub fn authenticate_ev2_first(&mut self, key_no: u8, key: &KeyMaterial) -> Result<AuthResult> {
        self.end_session();
        let mut auth = Ev2Authenticator::new(self.framer, &mut self.rng);
        let outcome = auth.authenticate_first(&mut self.transport, key_no, key)?;
        Ok(self.install(outcome))
    }

    /// EV2 non-first authentication inside the current transaction
    pub fn authenticate_ev2_non_first(
        &mut self,
        key_no: u8,
        key: &KeyMaterial,
    ) -> Result<AuthResult> {
        let session = self.session.as_mut().ok_or(Error::Precondition(
            "non-first authentication needs an EV2 transaction",
        ))?;

        let mut auth = Ev2Authenticator::new(self.framer, &mut self.rng);
        match auth.authenticate_non_first(&mut self.transport, session, key_no, key)? {
            AuthOutcome::Authenticated(()) => Ok(AuthOutcome::Authenticated(session.diagnostics())),
            AuthOutcome::Rejected => Ok(AuthOutcome::Rejected),
        }
    }

    /// Read from a standard or backup data file
    ///
    /// A `length` of zero reads to the end of the file.
    #[instrument(level = "debug", skip(self))]
    pub fn read_data(
        &mut self,
        file_no: u8,
        offset: u32,
        length: u32,
        mode: CommunicationMode,
    ) -> Result<Vec<u8>> {
        let header = file_header(file_no, offset, length)?;
        let expected = (length != 0).then_some(length as usize);

        let data = self.secured(cmd::READ_DATA, &header, &[], mode, expected)?;
        if expected.is_some_and(|len| len != data.len()) {
            return Err(Error::malformed("read data", "unexpected data length"));
        }
        Ok(data)
    }

    /// Write to a standard or backup data file
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn write_data(
        &mut self,
        file_no: u8,
        offset: u32,
        data: &[u8],
        mode: CommunicationMode,
    ) -> Result<()> {
        let length = u32::try_from(data.len())
            .ok()
            .filter(|&len| len > 0)
            .ok_or(Error::InvalidParameter("write length out of range"))?;
        let header = file_header(file_no, offset, length)?;

        self.secured(cmd::WRITE_DATA, &header, data, mode, Some(0))?;
        Ok(())
    }

    /// Read the current balance of a value file
    #[instrument(level = "debug", skip(self))]
    pub fn get_value(&mut self, file_no: u8, mode: CommunicationMode) -> Result<i32> {
        check_file_no(file_no)?;
        let data = self.secured(cmd::GET_VALUE, &[file_no], &[], mode, Some(4))?;
        let bytes: [u8; 4] = data
            .as_slice()
            .try_into()
            .map_err(|_| Error::malformed("get value", "value is not four bytes"))?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Increase a value file; takes effect on commit
    pub fn credit(&mut self, file_no: u8, amount: i32, mode: CommunicationMode) -> Result<()> {
        self.value_operation(cmd::CREDIT, file_no, amount, mode)
    }

    /// Decrease a value file; takes effect on commit
    pub fn debit(&mut self, file_no: u8, amount: i32, mode: CommunicationMode) -> Result<()> {
        self.value_operation(cmd::DEBIT, file_no, amount, mode)
    }

    /// Commit pending backup, value and record changes
    pub fn commit_transaction(&mut self) -> Result<()> {
        let mode = self.transaction_mode();
        self.secured(cmd::COMMIT_TRANSACTION, &[], &[], mode, Some(0))?;
        debug!("Transaction committed");
        Ok(())
    }

    /// Discard pending backup, value and record changes
    pub fn abort_transaction(&mut self) -> Result<()> {
        let mode = self.transaction_mode();
        self.secured(cmd::ABORT_TRANSACTION, &[], &[], mode, Some(0))?;
        debug!("Transaction aborted");
        Ok(())
    }

    /// Manufacturing data
    pub fn get_version(&mut self) -> Result<VersionInfo> {
        let data = self.secured(cmd::GET_VERSION, &[], &[], CommunicationMode::Plain, None)?;
        VersionInfo::parse(&data)
    }

    /// Real UID of a card using random ID
    ///
    /// Needs a live EV1 or EV2 session; the UID always travels encrypted.
    pub fn get_card_uid(&mut self) -> Result<[u8; UID_LEN]> {
        let session = self
            .session
            .as_ref()
            .filter(|session| session.is_live())
            .ok_or(Error::NotAuthenticated)?;
        if session.mode() == AuthMode::LegacyD40 {
            return Err(Error::UnsupportedMode {
                mode: CommunicationMode::Full,
                auth: AuthMode::LegacyD40,
            });
        }

        let data = self.secured(cmd::GET_CARD_UID, &[], &[], CommunicationMode::Full, Some(UID_LEN))?;
        data.as_slice()
            .try_into()
            .map_err(|_| Error::malformed("get card UID", "UID is not seven bytes"))
    }

    fn value_operation(
        &mut self,
        command: u8,
        file_no: u8,
        amount: i32,
        mode: CommunicationMode,
    ) -> Result<()> {
        check_file_no(file_no)?;
        if amount < 0 {
            return Err(Error::InvalidParameter("amount must not be negative"));
        }
        self.secured(command, &[file_no], &amount.to_le_bytes(), mode, Some(0))?;
        Ok(())
    }

    /// EV2 transactions MAC commit and abort, everything else sends them plain
    fn transaction_mode(&self) -> CommunicationMode {
        match &self.session {
            Some(session) if session.is_live() && session.mode().is_ev2() => {
                CommunicationMode::Maced
            }
            _ => CommunicationMode::Plain,
        }
    }

    fn install(&mut self, outcome: AuthOutcome) -> AuthResult {
        match outcome {
            AuthOutcome::Authenticated(session) => {
                let diagnostics = session.diagnostics();
                self.session = Some(session);
                AuthOutcome::Authenticated(diagnostics)
            }
            AuthOutcome::Rejected => AuthOutcome::Rejected,
        }
    }

    fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.invalidate();
        }
    }

    /// Run one command under the current session
    ///
    /// Without a live session only plain commands are allowed and they go out
    /// unprotected.
    fn secured(
        &mut self,
        command: u8,
        header: &[u8],
        data: &[u8],
        mode: CommunicationMode,
        expected_len: Option<usize>,
    ) -> Result<Vec<u8>> {
        let Some(session) = self.session.as_mut().filter(|session| session.is_live()) else {
            if mode != CommunicationMode::Plain {
                return Err(Error::NotAuthenticated);
            }
            let mut params = header.to_vec();
            params.extend_from_slice(data);
            return Ok(exchange(&self.framer, &mut self.transport, command, &params)?.to_vec());
        };

        let mut messaging = SecureMessagingSession::new(session, mode)?;
        let params = messaging.wrap_command(command, header, data)?;
        let result = exchange(&self.framer, &mut self.transport, command, &params)
            .and_then(|payload| messaging.unwrap_response(&payload, expected_len));

        if let Err(e) = &result {
            warn!(command = format_args!("{command:02X}"), error = %e, "Session ended by failed command");
            session.invalidate();
        }
        result
    }
}

fn exchange<T: CardTransport + ?Sized>(
    framer: &Framer,
    transport: &mut T,
    command: u8,
    params: &[u8],
) -> Result<Bytes> {
    let payload = if params.is_empty() {
        framer.send_and_collect(transport, command, None)?
    } else {
        framer.send_chunked(transport, command, params)?
    };
    Ok(payload)
}

fn check_file_no(file_no: u8) -> Result<()> {
    if file_no > MAX_FILE_NO {
        return Err(Error::InvalidParameter("file number out of range"));
    }
    Ok(())
}

/// `file_no || offset(3, LE) || length(3, LE)`
fn file_header(file_no: u8, offset: u32, length: u32) -> Result<[u8; 7]> {
    check_file_no(file_no)?;
    if offset > MAX_24BIT || length > MAX_24BIT {
        return Err(Error::InvalidParameter("offset or length exceeds 24 bits"));
    }

    let mut header = [0u8; 7];
    header[0] = file_no;
    header[1..4].copy_from_slice(&offset.to_le_bytes()[..3]);
    header[4..7].copy_from_slice(&length.to_le_bytes()[..3]);
    Ok(header)
}

/// Product generation, from the hardware major version
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CardGeneration {
    /// MIFARE DESFire (D40)
    #[display("DESFire D40")]
    D40,
    /// MIFARE DESFire EV1
    #[display("DESFire EV1")]
    Ev1,
    /// MIFARE DESFire EV2
    #[display("DESFire EV2")]
    Ev2,
    /// MIFARE DESFire EV3
    #[display("DESFire EV3")]
    Ev3,
    /// Any other major version
    #[display("unknown (major {_0:#04x})")]
    Unknown(u8),
}

/// One of the two component blocks of GetVersion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentVersion {
    /// Vendor, 0x04 for NXP
    pub vendor_id: u8,
    /// Product type
    pub kind: u8,
    /// Product subtype
    pub subtype: u8,
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Encoded storage size
    pub storage_size: u8,
    /// Communication protocol type
    pub protocol: u8,
}

impl ComponentVersion {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            vendor_id: bytes[0],
            kind: bytes[1],
            subtype: bytes[2],
            major: bytes[3],
            minor: bytes[4],
            storage_size: bytes[5],
            protocol: bytes[6],
        }
    }

    /// Storage size in bytes
    ///
    /// When the low bit of the encoded size is set the real size lies
    /// between this value and twice this value. `None` when the encoded size
    /// does not fit a `usize`.
    pub const fn storage_bytes(&self) -> Option<usize> {
        1usize.checked_shl((self.storage_size >> 1) as u32)
    }
}

/// Parsed GetVersion response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Hardware information
    pub hardware: ComponentVersion,
    /// Software information
    pub software: ComponentVersion,
    /// UID
    pub uid: [u8; UID_LEN],
    /// Production batch number
    pub batch: [u8; 5],
    /// Calendar week of production, BCD
    pub production_week: u8,
    /// Year of production, BCD
    pub production_year: u8,
}

impl VersionInfo {
    /// Parse the concatenated payload of the three GetVersion frames
    ///
    /// Newer cards append extra bytes to the last frame; they are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < VERSION_LEN {
            return Err(Error::malformed("get version", "version data too short"));
        }

        let mut uid = [0u8; UID_LEN];
        uid.copy_from_slice(&data[14..21]);
        let mut batch = [0u8; 5];
        batch.copy_from_slice(&data[21..26]);

        Ok(Self {
            hardware: ComponentVersion::parse(&data[0..7]),
            software: ComponentVersion::parse(&data[7..14]),
            uid,
            batch,
            production_week: data[26],
            production_year: data[27],
        })
    }

    /// Product generation
    pub const fn generation(&self) -> CardGeneration {
        match self.hardware.major {
            0x00 => CardGeneration::D40,
            0x01 => CardGeneration::Ev1,
            0x12 => CardGeneration::Ev2,
            0x30 | 0x33 => CardGeneration::Ev3,
            other => CardGeneration::Unknown(other),
        }
    }
}
