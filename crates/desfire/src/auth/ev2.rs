//! EV2 authentication (`0x71` first, `0x77` non-first)
//!
//! First authentication opens a transaction: the card assigns a transaction
//! identifier and the command counter starts at zero. Non-first
//! authentication swaps the session keys inside that transaction and leaves
//! identifier and counter as they are.

use desfire_apdu_core::{CardTransport, Framer};
use rand::{CryptoRng, RngCore};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use super::{AuthOutcome, check_key_no, ct_eq, expect_challenge, expect_proof, random_challenge};
use crate::constants::{TI_LEN, cmd};
use crate::crypto::{cbc_decrypt, cbc_encrypt, rotate_left, rotate_right};
use crate::kdf::ev2_session_keys;
use crate::keys::{KeyMaterial, KeyType};
use crate::session::{AuthenticationSession, Capabilities};
use crate::{Error, Result};

const ZERO_IV: [u8; 16] = [0; 16];

/// Length of the decrypted first authentication reply
const FIRST_REPLY_LEN: usize = TI_LEN + 16 + 6 + 6;

/// Runs the EV2 handshakes
#[derive(Debug)]
pub struct Ev2Authenticator<'a, R: ?Sized> {
    framer: Framer,
    rng: &'a mut R,
}

impl<'a, R> Ev2Authenticator<'a, R>
where
    R: RngCore + CryptoRng + ?Sized,
{
    /// Create an authenticator drawing RndA from `rng`
    pub fn new(framer: Framer, rng: &'a mut R) -> Self {
        Self { framer, rng }
    }

    /// EV2 first authentication
    ///
    /// On success the returned session carries a fresh transaction
    /// identifier, a zero command counter and the card's capabilities.
    #[instrument(level = "debug", skip(self, transport, key))]
    pub fn authenticate_first<T: CardTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        key_no: u8,
        key: &KeyMaterial,
    ) -> Result<AuthOutcome> {
        check_key_no(key_no)?;
        check_aes(key)?;

        // No PCDcap2 is offered, so LenCap is zero
        let Some((rnd_a, rnd_b, reply)) = self.handshake(
            transport,
            cmd::AUTHENTICATE_EV2_FIRST,
            &[key_no, 0x00],
            key,
            FIRST_REPLY_LEN,
        )?
        else {
            return Ok(AuthOutcome::Rejected);
        };

        let plain = Zeroizing::new(cbc_decrypt(KeyType::Aes, key.as_bytes(), &ZERO_IV, &reply)?);
        let (ti, rest) = plain.split_at(TI_LEN);
        let (rotated, caps) = rest.split_at(16);

        if !ct_eq(&rotate_right(rotated), rnd_a.as_slice()) {
            warn!(key_no, "Card proof does not match RndA");
            return Ok(AuthOutcome::Rejected);
        }

        let mut transaction_identifier = [0u8; TI_LEN];
        transaction_identifier.copy_from_slice(ti);
        let mut capabilities = Capabilities::default();
        capabilities.pd_cap2.copy_from_slice(&caps[..6]);
        capabilities.pcd_cap2.copy_from_slice(&caps[6..]);

        let (enc, mac) = ev2_session_keys(key.as_bytes(), &rnd_a, &rnd_b)?;
        debug!(key_no, ti = %hex::encode(transaction_identifier), "EV2 first authentication succeeded");
        Ok(AuthOutcome::Authenticated(AuthenticationSession::ev2_first(
            key_no,
            &enc,
            &mac,
            transaction_identifier,
            capabilities,
        )))
    }

    /// EV2 non-first authentication inside the transaction of `session`
    ///
    /// On success `session` gets the new keys. On rejection or failure its
    /// keys are dropped, but transaction identifier and counter are kept so
    /// that another non-first attempt remains possible.
    #[instrument(level = "debug", skip(self, transport, session, key))]
    pub fn authenticate_non_first<T: CardTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        session: &mut AuthenticationSession,
        key_no: u8,
        key: &KeyMaterial,
    ) -> Result<AuthOutcome<()>> {
        if !session.allows_non_first() {
            return Err(Error::Precondition(
                "non-first authentication needs an EV2 transaction",
            ));
        }
        check_key_no(key_no)?;
        check_aes(key)?;

        let outcome = self.non_first(transport, key_no, key);
        match outcome {
            Ok(Some((enc, mac))) => {
                session.rekey_non_first(key_no, &enc, &mac);
                debug!(key_no, counter = session.command_counter(), "EV2 non-first authentication succeeded");
                Ok(AuthOutcome::Authenticated(()))
            }
            Ok(None) => {
                session.invalidate_keys();
                Ok(AuthOutcome::Rejected)
            }
            Err(e) => {
                session.invalidate_keys();
                Err(e)
            }
        }
    }

    fn non_first<T: CardTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        key_no: u8,
        key: &KeyMaterial,
    ) -> Result<Option<(Zeroizing<[u8; 16]>, Zeroizing<[u8; 16]>)>> {
        let Some((rnd_a, rnd_b, reply)) = self.handshake(
            transport,
            cmd::AUTHENTICATE_EV2_NON_FIRST,
            &[key_no],
            key,
            16,
        )?
        else {
            return Ok(None);
        };

        let rotated = Zeroizing::new(cbc_decrypt(KeyType::Aes, key.as_bytes(), &ZERO_IV, &reply)?);
        if !ct_eq(&rotate_right(&rotated), rnd_a.as_slice()) {
            warn!(key_no, "Card proof does not match RndA");
            return Ok(None);
        }

        ev2_session_keys(key.as_bytes(), &rnd_a, &rnd_b).map(Some)
    }

    /// Both passes of the exchange; returns `RndA`, `RndB` and the encrypted
    /// reply, or `None` when the card refused the token
    #[allow(clippy::type_complexity)]
    fn handshake<T: CardTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: u8,
        parameters: &[u8],
        key: &KeyMaterial,
        reply_len: usize,
    ) -> Result<Option<(Zeroizing<[u8; 16]>, Zeroizing<[u8; 16]>, Vec<u8>)>> {
        let raw_key = key.as_bytes();

        let response = self.framer.transceive(transport, command, Some(parameters))?;
        let ek_rnd_b = expect_challenge(&response, "EV2 challenge", 16)?;

        let mut rnd_b = Zeroizing::new([0u8; 16]);
        rnd_b.copy_from_slice(&cbc_decrypt(KeyType::Aes, raw_key, &ZERO_IV, ek_rnd_b)?);

        let mut rnd_a = Zeroizing::new([0u8; 16]);
        rnd_a.copy_from_slice(&random_challenge(&mut *self.rng, 16));

        let mut token = Zeroizing::new(rnd_a.to_vec());
        token.extend_from_slice(&rotate_left(rnd_b.as_slice()));
        let ek_token = cbc_encrypt(KeyType::Aes, raw_key, &ZERO_IV, &token)?;

        let response = self
            .framer
            .transceive(transport, cmd::ADDITIONAL_FRAME, Some(&ek_token))?;
        let Some(reply) = expect_proof(&response, "EV2 proof", reply_len)? else {
            warn!("Card refused authentication token");
            return Ok(None);
        };

        Ok(Some((rnd_a, rnd_b, reply.to_vec())))
    }
}

fn check_aes(key: &KeyMaterial) -> Result<()> {
    if key.key_type() != KeyType::Aes {
        return Err(Error::InvalidParameter("EV2 authentication requires an AES key"));
    }
    Ok(())
}
