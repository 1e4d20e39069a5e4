//! Cryptographic primitives used by DESFire authentication and messaging
//!
//! Every function here is pure: it takes owned or borrowed byte buffers and
//! returns freshly allocated output. Cipher selection is driven by
//! [`KeyType`]:
//!
//! | Key type | Cipher     | Block |
//! |----------|------------|-------|
//! | DES      | DES        | 8     |
//! | 2K3DES   | TDEA EDE2  | 8     |
//! | 3K3DES   | TDEA EDE3  | 8     |
//! | AES      | AES-128    | 16    |

use aes::Aes128;
use cipher::{
    Block, BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
    block_padding::NoPadding,
};
use cmac::{Cmac, Mac};
use crc::{CRC_16_ISO_IEC_14443_3_A, CRC_32_JAMCRC, Crc};
use des::{Des, TdesEde2, TdesEde3};

use crate::keys::{KeyType, check_key_len};
use crate::{Error, Result};

/// Full AES-CMAC tag
pub type Cmac16 = [u8; 16];

/// Truncated EV2 MAC
pub type Mac8 = [u8; 8];

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ISO_IEC_14443_3_A);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// Run `$body` with `$cipher` bound to the block cipher of `$key_type`
macro_rules! with_cipher {
    ($key_type:expr, $cipher:ident => $body:expr) => {
        match $key_type {
            KeyType::Des => {
                type $cipher = Des;
                $body
            }
            KeyType::Tdes => {
                type $cipher = TdesEde2;
                $body
            }
            KeyType::Tktdes => {
                type $cipher = TdesEde3;
                $body
            }
            KeyType::Aes => {
                type $cipher = Aes128;
                $body
            }
        }
    };
}

/// CBC encrypt block aligned `data`
pub fn cbc_encrypt(key_type: KeyType, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_key_len(key_type, key)?;
    check_iv(key_type, iv)?;
    with_cipher!(key_type, C => cbc_encrypt_with::<C>(key, iv, data))
}

/// CBC decrypt block aligned `data`
pub fn cbc_decrypt(key_type: KeyType, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_key_len(key_type, key)?;
    check_iv(key_type, iv)?;
    with_cipher!(key_type, C => cbc_decrypt_with::<C>(key, iv, data))
}

/// D40 send mode
///
/// Each block is XORed with the previous output block and then *decrypted*.
/// The card recovers the plaintext by encrypting, since its legacy engine
/// only runs the cipher in one direction per side.
pub fn send_mode_transform(key_type: KeyType, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_key_len(key_type, key)?;
    with_cipher!(key_type, C => send_mode_with::<C>(key, data))
}

/// D40 receive mode
///
/// Decrypt each block and XOR with the previous ciphertext block, which is
/// plain CBC decryption under an all-zero IV.
pub fn receive_mode_transform(key_type: KeyType, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    cbc_decrypt(key_type, key, &zero_iv(key_type), data)
}

/// AES-CMAC (NIST SP 800-38B)
pub fn aes_cmac(key: &[u8], message: &[u8]) -> Result<Cmac16> {
    check_key_len(KeyType::Aes, key)?;
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
        .map_err(|_| Error::Crypto("invalid CMAC key"))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// CMAC (NIST SP 800-38B) whose CBC chain starts from `iv`
///
/// EV1 sessions MAC every exchange with the session key and carry the full
/// tag into the next exchange as IV. With a zero IV this is plain CMAC over
/// the cipher of `key_type`.
pub fn cmac_chained(key_type: KeyType, key: &[u8], iv: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let block_size = key_type.block_size();
    let zero = zero_iv(key_type);
    let k1 = cmac_subkey(&cbc_encrypt(key_type, key, &zero, &zero)?);

    let (mut padded, subkey) = if !message.is_empty() && message.len() % block_size == 0 {
        (message.to_vec(), k1)
    } else {
        let k2 = cmac_subkey(&k1);
        (pad_iso9797_m2(message, block_size), k2)
    };

    let last = padded.len() - block_size;
    padded[last..].iter_mut().zip(&subkey).for_each(|(b, k)| *b ^= k);

    let mut encrypted = cbc_encrypt(key_type, key, iv, &padded)?;
    Ok(encrypted.split_off(last))
}

/// EV2 MAC truncation: the bytes at odd indices of the full tag
pub fn truncate_mac(mac: &Cmac16) -> Mac8 {
    std::array::from_fn(|i| mac[2 * i + 1])
}

/// D40 MAC: first four bytes of the last CBC block over zero padded data
pub fn legacy_mac(key_type: KeyType, key: &[u8], data: &[u8]) -> Result<[u8; 4]> {
    let block_size = key_type.block_size();
    let mut padded = pad_zero(data, block_size);
    if padded.is_empty() {
        padded.resize(block_size, 0);
    }

    let encrypted = cbc_encrypt(key_type, key, &zero_iv(key_type), &padded)?;
    let last = &encrypted[encrypted.len() - block_size..];
    Ok([last[0], last[1], last[2], last[3]])
}

/// CRC16 (ISO/IEC 14443-3 type A), least significant byte first
pub fn crc16(data: &[u8]) -> [u8; 2] {
    CRC16.checksum(data).to_le_bytes()
}

/// CRC32 as used by EV1 (IEEE, no final XOR), least significant byte first
pub fn crc32(data: &[u8]) -> [u8; 4] {
    CRC32.checksum(data).to_le_bytes()
}

/// CRC16 over `data[offset..offset + len]`
pub fn crc16_range(data: &[u8], offset: usize, len: usize) -> Result<[u8; 2]> {
    range(data, offset, len).map(crc16)
}

/// CRC32 over `data[offset..offset + len]`
pub fn crc32_range(data: &[u8], offset: usize, len: usize) -> Result<[u8; 4]> {
    range(data, offset, len).map(crc32)
}

/// Rotate left by one byte
pub fn rotate_left(data: &[u8]) -> Vec<u8> {
    let mut rotated = data.to_vec();
    if !rotated.is_empty() {
        rotated.rotate_left(1);
    }
    rotated
}

/// Rotate right by one byte
pub fn rotate_right(data: &[u8]) -> Vec<u8> {
    let mut rotated = data.to_vec();
    if !rotated.is_empty() {
        rotated.rotate_right(1);
    }
    rotated
}

/// XOR two equally long buffers
pub fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// ISO/IEC 9797-1 padding method 2: `80` then zeros to a block boundary
pub fn pad_iso9797_m2(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut padded = Vec::with_capacity(data.len() + block_size);
    padded.extend_from_slice(data);
    padded.push(0x80);
    padded.resize(padded.len().next_multiple_of(block_size), 0x00);
    padded
}

/// Strip ISO/IEC 9797-1 method 2 padding
pub fn unpad_iso9797_m2(data: &[u8], block_size: usize) -> Result<&[u8]> {
    let marker = data
        .iter()
        .rposition(|&b| b != 0x00)
        .ok_or(Error::IntegrityCheck("missing padding"))?;

    if data[marker] != 0x80 || data.len() - marker > block_size {
        return Err(Error::IntegrityCheck("invalid padding"));
    }
    Ok(&data[..marker])
}

/// Zero pad to a block boundary; aligned input is returned unchanged
pub fn pad_zero(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.resize(data.len().next_multiple_of(block_size), 0x00);
    padded
}

/// All-zero IV for the cipher of a key type
pub fn zero_iv(key_type: KeyType) -> Vec<u8> {
    vec![0u8; key_type.block_size()]
}

fn check_iv(key_type: KeyType, iv: &[u8]) -> Result<()> {
    if iv.len() == key_type.block_size() {
        Ok(())
    } else {
        Err(Error::Crypto("IV length does not match block size"))
    }
}

/// Doubling in GF(2^n) for CMAC subkey generation
fn cmac_subkey(block: &[u8]) -> Vec<u8> {
    let rb = if block.len() == 16 { 0x87 } else { 0x1B };
    let mut doubled: Vec<u8> = block
        .iter()
        .zip(block.iter().skip(1).chain([&0u8]))
        .map(|(byte, next)| (byte << 1) | (next >> 7))
        .collect();
    if block.first().is_some_and(|b| b & 0x80 != 0) {
        if let Some(last) = doubled.last_mut() {
            *last ^= rb;
        }
    }
    doubled
}

fn range(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(Error::InvalidParameter("CRC range outside data"))
}

fn cbc_encrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let mut buffer = data.to_vec();
    let len = buffer.len();
    cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("invalid key or IV length"))?
        .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
        .map_err(|_| Error::Crypto("data is not block aligned"))?;
    Ok(buffer)
}

fn cbc_decrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    let mut buffer = data.to_vec();
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("invalid key or IV length"))?
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| Error::Crypto("data is not block aligned"))?;
    Ok(buffer)
}

fn send_mode_with<C>(key: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockDecrypt + KeyInit,
{
    let block_size = C::block_size();
    if data.len() % block_size != 0 {
        return Err(Error::Crypto("data is not block aligned"));
    }

    let cipher = C::new_from_slice(key).map_err(|_| Error::Crypto("invalid key length"))?;
    let mut previous = Block::<C>::default();
    let mut output = Vec::with_capacity(data.len());

    for chunk in data.chunks_exact(block_size) {
        let mut block = Block::<C>::clone_from_slice(chunk);
        block.iter_mut().zip(&previous).for_each(|(b, p)| *b ^= p);
        cipher.decrypt_block(&mut block);
        output.extend_from_slice(&block);
        previous = block;
    }

    Ok(output)
}
