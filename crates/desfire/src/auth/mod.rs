//! Authentication handshakes
//!
//! Every handshake is a three pass mutual authentication: the card sends an
//! encrypted challenge RndB, the host answers with `RndA || rotl(RndB)` and
//! the card proves knowledge of the key by returning `rotl(RndA)`.
//!
//! A proof mismatch is not an error. Handshakes return
//! [`AuthOutcome::Rejected`] for it and reserve `Err` for transport and
//! protocol failures.

pub mod ev2;
pub mod legacy;

pub use ev2::Ev2Authenticator;
pub use legacy::{LegacyAuthenticator, LegacyState};

use desfire_apdu_core::Response;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::constants::MAX_KEY_NO;
use crate::session::AuthenticationSession;
use crate::{Error, Result};

/// Result of a completed handshake
#[derive(Debug)]
pub enum AuthOutcome<S = AuthenticationSession> {
    /// The card proved knowledge of the key
    Authenticated(S),
    /// The card's proof did not match, or the card refused ours
    Rejected,
}

impl<S> AuthOutcome<S> {
    /// Whether the handshake succeeded
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

pub(crate) fn check_key_no(key_no: u8) -> Result<()> {
    if key_no > MAX_KEY_NO {
        return Err(Error::InvalidParameter("key number out of range"));
    }
    Ok(())
}

pub(crate) fn random_challenge<R>(rng: &mut R, len: usize) -> Zeroizing<Vec<u8>>
where
    R: RngCore + CryptoRng + ?Sized,
{
    let mut challenge = Zeroizing::new(vec![0u8; len]);
    rng.fill_bytes(&mut challenge);
    challenge
}

/// Payload of the card's challenge frame, which must be `91 AF`
pub(crate) fn expect_challenge<'r>(
    response: &'r Response,
    step: &'static str,
    len: usize,
) -> Result<&'r [u8]> {
    if !response.is_additional_frame() {
        return Err(Error::Protocol {
            step,
            status: response.status(),
        });
    }
    if response.payload().len() != len {
        return Err(Error::malformed(step, "unexpected challenge length"));
    }
    Ok(&response.payload()[..])
}

/// Payload of the card's proof frame
///
/// `Ok(None)` means the card refused our token with `91 AE`.
pub(crate) fn expect_proof<'r>(
    response: &'r Response,
    step: &'static str,
    len: usize,
) -> Result<Option<&'r [u8]>> {
    if response.status().is_authentication_error() {
        return Ok(None);
    }
    if !response.is_ok() {
        return Err(Error::Protocol {
            step,
            status: response.status(),
        });
    }
    if response.payload().len() != len {
        return Err(Error::malformed(step, "unexpected proof length"));
    }
    Ok(Some(&response.payload()[..]))
}

/// Compare without early exit
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Last `block_size` bytes of a buffer
pub(crate) fn last_block(data: &[u8], block_size: usize) -> &[u8] {
    &data[data.len().saturating_sub(block_size)..]
}
