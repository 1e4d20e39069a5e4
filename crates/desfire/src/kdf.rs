//! Session key derivation

use zeroize::Zeroizing;

use crate::crypto::aes_cmac;
use crate::keys::{KeyType, check_key_len};
use crate::{Error, Result};

/// Label of the EV2 encryption session vector
pub const ENC_LABEL: [u8; 2] = [0xA5, 0x5A];
/// Label of the EV2 MAC session vector
pub const MAC_LABEL: [u8; 2] = [0x5A, 0xA5];

/// Session key of a legacy (D40 or EV1) handshake
///
/// Built from slices of RndA and RndB; the layout depends on the cipher.
pub fn legacy_session_key(key_type: KeyType, rnd_a: &[u8], rnd_b: &[u8]) -> Result<Vec<u8>> {
    let needed = key_type.challenge_len();
    if rnd_a.len() != needed || rnd_b.len() != needed {
        return Err(Error::InvalidParameter("challenge length does not match key type"));
    }

    let slices: &[(usize, usize)] = match key_type {
        KeyType::Des => &[(0, 4)],
        KeyType::Tdes => &[(0, 4), (4, 8)],
        KeyType::Tktdes => &[(0, 4), (6, 10), (12, 16)],
        KeyType::Aes => &[(0, 4), (12, 16)],
    };

    let mut key = Vec::with_capacity(key_type.key_len());
    for &(start, end) in slices {
        key.extend_from_slice(&rnd_a[start..end]);
        key.extend_from_slice(&rnd_b[start..end]);
    }
    Ok(key)
}

/// EV2 session vector
///
/// ```text
/// label(2) 00 01 00 80 A[0..2] (A[2..8] ^ B[0..6]) B[6..16] A[8..16]
/// ```
pub fn session_vector(label: [u8; 2], rnd_a: &[u8; 16], rnd_b: &[u8; 16]) -> [u8; 32] {
    let mut sv = [0u8; 32];
    sv[0..2].copy_from_slice(&label);
    sv[2..6].copy_from_slice(&[0x00, 0x01, 0x00, 0x80]);
    sv[6..8].copy_from_slice(&rnd_a[0..2]);
    for i in 0..6 {
        sv[8 + i] = rnd_a[2 + i] ^ rnd_b[i];
    }
    sv[14..24].copy_from_slice(&rnd_b[6..16]);
    sv[24..32].copy_from_slice(&rnd_a[8..16]);
    sv
}

/// EV2 session keys `(SesAuthENCKey, SesAuthMACKey)`
pub fn ev2_session_keys(
    key: &[u8],
    rnd_a: &[u8; 16],
    rnd_b: &[u8; 16],
) -> Result<(Zeroizing<[u8; 16]>, Zeroizing<[u8; 16]>)> {
    check_key_len(KeyType::Aes, key)?;
    let enc_sv = Zeroizing::new(session_vector(ENC_LABEL, rnd_a, rnd_b));
    let mac_sv = Zeroizing::new(session_vector(MAC_LABEL, rnd_a, rnd_b));

    let enc = Zeroizing::new(aes_cmac(key, enc_sv.as_slice())?);
    let mac = Zeroizing::new(aes_cmac(key, mac_sv.as_slice())?);
    Ok((enc, mac))
}
