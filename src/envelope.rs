//! Authenticated-encryption envelope around the codec's byte stream.
//!
//! Layout on disk: `MAGIC (7) || nonce (16) || tag (16) || ciphertext (N)`.
//! The magic bytes double as AEAD associated data, binding the ciphertext
//! to this on-disk format.

use crate::error::{Error, Result};
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes128;
use aes_gcm::AesGcm;
use rand::RngCore;

pub const MAGIC: &[u8; 7] = b"OBFUSFS";
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 16;

/// AES-128-GCM with a 16-byte nonce (the crate's default is 12 bytes; the
/// on-disk format fixes 16, so the nonce size is pinned explicitly here).
type Cipher = AesGcm<Aes128, U16>;

/// Right-pads `password` to 16 bytes using the "append the byte value equal
/// to the number of padding bytes" scheme, truncating anything past the
/// first 16 bytes. This intentionally reproduces a documented weakness
/// (see the crate's design notes): the key carries no more entropy than a
/// 16-byte password, and anything longer is silently capped.
fn derive_key(password: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let n = password.len().min(KEY_LEN);
    key[..n].copy_from_slice(&password[..n]);
    if n < KEY_LEN {
        let pad_byte = (KEY_LEN - n) as u8;
        for b in &mut key[n..] {
            *b = pad_byte;
        }
    }
    key
}

/// Encrypts `plaintext` under `password`, returning the full on-disk file
/// contents (magic, nonce, tag, ciphertext).
pub fn seal(plaintext: &[u8], password: &[u8]) -> Result<Vec<u8>> {
    let key = derive_key(password);
    let cipher = Cipher::new(GenericArray::from_slice(&key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: MAGIC,
            },
        )
        .map_err(|_| Error::Format("AEAD seal failed".into()))?;

    // `aead::encrypt` appends the tag to the end of the ciphertext; split it
    // back out so the on-disk layout can put the tag before the ciphertext.
    let split = sealed.len() - TAG_LEN;
    let (ciphertext, tag) = sealed.split_at(split);

    let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Decrypts and verifies a sealed file's contents, returning the plaintext.
pub fn open(sealed: &[u8], password: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < MAGIC.len() + NONCE_LEN + TAG_LEN {
        return Err(Error::Format("database file too short".into()));
    }

    let (magic, rest) = sealed.split_at(MAGIC.len());
    if magic != MAGIC.as_slice() {
        return Err(Error::Format("bad magic".into()));
    }

    let (nonce_bytes, rest) = rest.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let key = derive_key(password);
    let cipher = Cipher::new(GenericArray::from_slice(&key));
    let nonce = GenericArray::from_slice(nonce_bytes);

    // Reassemble ciphertext||tag, the layout `aead::decrypt` expects.
    let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &combined,
                aad: MAGIC,
            },
        )
        .map_err(|_| Error::Auth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_the_right_password() {
        let sealed = seal(b"hello, world", b"hunter2").unwrap();
        assert_eq!(open(&sealed, b"hunter2").unwrap(), b"hello, world");
    }

    #[test]
    fn rejects_the_wrong_password() {
        let sealed = seal(b"hello, world", b"hunter2").unwrap();
        assert!(matches!(open(&sealed, b"wrong"), Err(Error::Auth)));
    }

    #[test]
    fn rejects_bad_magic_without_decrypting() {
        let mut sealed = seal(b"hello, world", b"hunter2").unwrap();
        sealed[0] = b'X';
        assert!(matches!(open(&sealed, b"hunter2"), Err(Error::Format(_))));
    }

    #[test]
    fn nonce_is_fresh_per_seal() {
        let a = seal(b"same plaintext", b"pw").unwrap();
        let b = seal(b"same plaintext", b"pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn long_passwords_are_capped_at_sixteen_bytes() {
        let sealed = seal(b"x", b"0123456789ABCDEF-extra-tail").unwrap();
        assert_eq!(
            open(&sealed, b"0123456789ABCDEFdoesnt-matter-past-16").unwrap(),
            b"x"
        );
    }
}
