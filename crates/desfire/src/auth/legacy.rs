//! D40 and EV1 authentication (`0x0A`, `0x1A`, `0xAA`)

use desfire_apdu_core::{CardTransport, Framer};
use rand::{CryptoRng, RngCore};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use super::{
    AuthOutcome, check_key_no, ct_eq, expect_challenge, expect_proof, last_block,
    random_challenge,
};
use crate::constants::cmd;
use crate::crypto::{
    cbc_decrypt, cbc_encrypt, receive_mode_transform, rotate_left, rotate_right,
    send_mode_transform, zero_iv,
};
use crate::kdf::legacy_session_key;
use crate::keys::{KeyMaterial, KeyType};
use crate::session::{AuthMode, AuthenticationSession};
use crate::{Error, Result};

/// Progress of a legacy handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyState {
    /// No handshake started
    Idle,
    /// Authenticate command sent, waiting for `ek(RndB)`
    AwaitingEncRandB,
    /// Token sent, waiting for `ek(rotl(RndA))`
    AwaitingEncRandA,
    /// Handshake completed
    Authenticated,
    /// Handshake rejected or aborted
    Failed,
}

/// Runs the legacy handshakes
#[derive(Debug)]
pub struct LegacyAuthenticator<'a, R: ?Sized> {
    framer: Framer,
    rng: &'a mut R,
    state: LegacyState,
}

impl<'a, R> LegacyAuthenticator<'a, R>
where
    R: RngCore + CryptoRng + ?Sized,
{
    /// Create an authenticator drawing RndA from `rng`
    pub fn new(framer: Framer, rng: &'a mut R) -> Self {
        Self {
            framer,
            rng,
            state: LegacyState::Idle,
        }
    }

    /// Current handshake state
    pub const fn state(&self) -> LegacyState {
        self.state
    }

    /// Authenticate with the command that matches the key type
    pub fn authenticate<T: CardTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        key_no: u8,
        key: &KeyMaterial,
    ) -> Result<AuthOutcome> {
        let command = match key.key_type() {
            KeyType::Des | KeyType::Tdes => cmd::AUTHENTICATE,
            KeyType::Tktdes => cmd::AUTHENTICATE_ISO,
            KeyType::Aes => cmd::AUTHENTICATE_AES,
        };
        self.authenticate_with(transport, command, key_no, key)
    }

    /// Authenticate with an explicit command code
    ///
    /// The key type must fit the command: DES or 2K3DES for `0x0A`, 3K3DES
    /// for `0x1A` and AES for `0xAA`.
    #[instrument(level = "debug", skip(self, transport, key), fields(key_type = %key.key_type()))]
    pub fn authenticate_with<T: CardTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: u8,
        key_no: u8,
        key: &KeyMaterial,
    ) -> Result<AuthOutcome> {
        check_key_no(key_no)?;
        let mode = match (command, key.key_type()) {
            (cmd::AUTHENTICATE, KeyType::Des | KeyType::Tdes) => AuthMode::LegacyD40,
            (cmd::AUTHENTICATE_ISO, KeyType::Tktdes) => AuthMode::LegacyIso,
            (cmd::AUTHENTICATE_AES, KeyType::Aes) => AuthMode::LegacyAes,
            _ => {
                return Err(Error::InvalidParameter(
                    "key type does not match authentication command",
                ));
            }
        };

        let key = key.with_version(0);
        self.state = LegacyState::Idle;

        let outcome = self.handshake(transport, command, mode, key_no, &key);
        self.state = match &outcome {
            Ok(AuthOutcome::Authenticated(_)) => LegacyState::Authenticated,
            _ => LegacyState::Failed,
        };
        outcome
    }

    fn handshake<T: CardTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: u8,
        mode: AuthMode,
        key_no: u8,
        key: &KeyMaterial,
    ) -> Result<AuthOutcome> {
        let key_type = key.key_type();
        let raw_key = key.as_bytes();
        let challenge_len = key_type.challenge_len();
        let block_size = key_type.block_size();

        self.state = LegacyState::AwaitingEncRandB;
        let response = self.framer.transceive(transport, command, Some(&[key_no]))?;
        let ek_rnd_b = expect_challenge(&response, "legacy challenge", challenge_len)?;

        // Both directions start from a zero IV for the challenge
        let rnd_b = Zeroizing::new(receive_mode_transform(key_type, raw_key, ek_rnd_b)?);
        let rnd_a = random_challenge(&mut *self.rng, challenge_len);

        let mut token = Zeroizing::new(rnd_a.to_vec());
        token.extend_from_slice(&rotate_left(&rnd_b));

        let ek_token = if mode == AuthMode::LegacyD40 {
            send_mode_transform(key_type, raw_key, &token)?
        } else {
            cbc_encrypt(key_type, raw_key, last_block(ek_rnd_b, block_size), &token)?
        };

        self.state = LegacyState::AwaitingEncRandA;
        let response = self
            .framer
            .transceive(transport, cmd::ADDITIONAL_FRAME, Some(&ek_token))?;
        let Some(ek_rnd_a) = expect_proof(&response, "legacy proof", challenge_len)? else {
            warn!(key_no, "Card refused authentication token");
            return Ok(AuthOutcome::Rejected);
        };

        let rotated = Zeroizing::new(if mode == AuthMode::LegacyD40 {
            receive_mode_transform(key_type, raw_key, ek_rnd_a)?
        } else {
            cbc_decrypt(key_type, raw_key, last_block(&ek_token, block_size), ek_rnd_a)?
        });

        if !ct_eq(&rotate_right(&rotated), &rnd_a) {
            warn!(key_no, "Card proof does not match RndA");
            return Ok(AuthOutcome::Rejected);
        }

        let session_key = if is_single_des(key) {
            // A 2K3DES key with equal halves runs as single DES on the card
            let mut des_key = legacy_session_key(KeyType::Des, &rnd_a, &rnd_b)?;
            des_key.extend_from_within(..);
            des_key
        } else {
            legacy_session_key(key_type, &rnd_a, &rnd_b)?
        };

        debug!(key_no, %mode, "Legacy authentication succeeded");
        Ok(AuthOutcome::Authenticated(AuthenticationSession::legacy(
            key_type,
            key_no,
            mode,
            session_key,
        )))
    }
}

fn is_single_des(key: &KeyMaterial) -> bool {
    let bytes = key.as_bytes();
    key.key_type() == KeyType::Tdes && bytes[..8] == bytes[8..]
}
