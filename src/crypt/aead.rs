//! AEAD_AES_256_CBC_HMAC_SHA_512, the authenticated encryption scheme used both for field values
//! and for wrapping data keys with a local master key.
//!
//! A 96-byte key is split into a MAC key, an encryption key and an IV key. The output is
//! `IV || AES-256-CBC(P) || HMAC-SHA-512(AD || IV || C || AL)[..32]`, where `AL` is the bit length
//! of the associated data as a big-endian `u64`.

use aes::Aes256;
use cbc::cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut,
    BlockEncryptMut,
    KeyIvInit,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha512;

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Length of a data encryption key or local master key.
pub(crate) const KEY_LEN: usize = 96;
const SUBKEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

/// How the initialization vector is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IvMode {
    /// Read from the OS-seeded thread RNG.
    Random,
    /// `HMAC-SHA-512(Kiv, AD || P)` truncated to 16 bytes, so equal inputs give equal outputs.
    Deterministic,
}

struct SubKeys<'a> {
    mac: &'a [u8],
    enc: &'a [u8],
    iv: &'a [u8],
}

fn split_key(key: &[u8]) -> Result<SubKeys<'_>> {
    if key.len() != KEY_LEN {
        return Err(Error::encryption(format!(
            "expected a {KEY_LEN} byte key, got {} bytes",
            key.len()
        )));
    }
    Ok(SubKeys {
        mac: &key[..SUBKEY_LEN],
        enc: &key[SUBKEY_LEN..2 * SUBKEY_LEN],
        iv: &key[2 * SUBKEY_LEN..],
    })
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 64]> {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(key)
        .map_err(|e| Error::encryption(format!("invalid HMAC key: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn tag(mac_key: &[u8], associated_data: &[u8], iv_and_ciphertext: &[u8]) -> Result<[u8; 64]> {
    let al = ((associated_data.len() as u64) * 8).to_be_bytes();
    hmac_sha512(mac_key, &[associated_data, iv_and_ciphertext, &al])
}

/// Encrypts `plaintext`, authenticating `associated_data` alongside it.
pub(crate) fn encrypt(
    key: &[u8],
    plaintext: &[u8],
    associated_data: &[u8],
    iv_mode: IvMode,
) -> Result<Vec<u8>> {
    let keys = split_key(key)?;

    let mut iv = [0u8; IV_LEN];
    match iv_mode {
        IvMode::Random => rand::rng().fill_bytes(&mut iv),
        IvMode::Deterministic => {
            let digest = hmac_sha512(keys.iv, &[associated_data, plaintext])?;
            iv.copy_from_slice(&digest[..IV_LEN]);
        }
    }

    let ciphertext = Aes256CbcEnc::new_from_slices(keys.enc, &iv)
        .map_err(|e| Error::encryption(format!("invalid AES key: {e}")))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    let t = tag(keys.mac, associated_data, &out)?;
    out.extend_from_slice(&t[..TAG_LEN]);
    Ok(out)
}

/// Verifies and decrypts the output of [`encrypt`].
pub(crate) fn decrypt(key: &[u8], ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    let keys = split_key(key)?;

    if ciphertext.len() < IV_LEN + BLOCK_LEN + TAG_LEN
        || (ciphertext.len() - IV_LEN - TAG_LEN) % BLOCK_LEN != 0
    {
        return Err(Error::encryption(format!(
            "malformed ciphertext of {} bytes",
            ciphertext.len()
        )));
    }

    let (body, received_tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
    let expected = tag(keys.mac, associated_data, body)?;
    // Compared in constant time.
    if ring::constant_time::verify_slices_are_equal(&expected[..TAG_LEN], received_tag).is_err() {
        return Err(Error::encryption("HMAC validation failure"));
    }

    let (iv, encrypted) = body.split_at(IV_LEN);
    Aes256CbcDec::new_from_slices(keys.enc, iv)
        .map_err(|e| Error::encryption(format!("invalid AES key: {e}")))?
        .decrypt_padded_vec_mut::<Pkcs7>(encrypted)
        .map_err(|_| Error::encryption("bad padding in decrypted ciphertext"))
}

/// The length of the output of [`encrypt`] for a plaintext of `len` bytes.
pub(crate) fn ciphertext_len(len: usize) -> usize {
    IV_LEN + (len / BLOCK_LEN + 1) * BLOCK_LEN + TAG_LEN
}

/// Encrypts a 32-byte token under another with AES-256-CBC and a random IV. The result is not
/// authenticated; only the server ever opens it.
pub(crate) fn seal_token(key: &[u8], token: &[u8]) -> Result<Vec<u8>> {
    if token.len() % BLOCK_LEN != 0 {
        return Err(Error::internal("sealed tokens must be whole AES blocks"));
    }
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    let sealed = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| Error::encryption(format!("invalid token key: {e}")))?
        .encrypt_padded_vec_mut::<NoPadding>(token);
    let mut out = iv.to_vec();
    out.extend_from_slice(&sealed);
    Ok(out)
}
