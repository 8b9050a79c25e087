//! ChaCha20 stream encryption for handshake payloads
//!
//! The handshake envelope encrypts its payload under a key that exists for
//! exactly one message, so the nonce is fixed at zero.
//!
//! # Key freshness
//!
//! A zero nonce is only sound while every key is used for a single
//! message. Callers must draw a new random key for every envelope and must
//! never cache one. Two messages under the same key leak the XOR of their
//! plaintexts.

use chacha20::cipher::{KeyIvInit, StreamCipher as _};
use chacha20::ChaCha20;

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

const ZERO_NONCE: [u8; NONCE_SIZE] = [0u8; NONCE_SIZE];

/// Single-use-key stream cipher
pub struct StreamCipher;

impl StreamCipher {
    /// XOR `buf` in place with the ChaCha20 keystream for `key`.
    ///
    /// Encryption and decryption are the same operation. `key` must be
    /// fresh random material that is never used for another message.
    pub fn apply_keystream(key: &[u8; KEY_SIZE], buf: &mut [u8]) {
        let mut cipher = ChaCha20::new(key.into(), &ZERO_NONCE.into());
        cipher.apply_keystream(buf);
    }
}
