//! Cryptographic primitives for relaychat
//!
//! This module provides all the cryptographic building blocks:
//! - `identity`: RSA identities, OAEP key wrapping and PSS signatures
//! - `cipher`: ChaCha20 encryption under single-use keys
//! - `hash`: SHA-256 hashing and HMAC-SHA256 tags

pub mod cipher;
pub mod error;
pub mod hash;
pub mod identity;

// Re-export commonly used types
pub use cipher::StreamCipher;
pub use error::{CryptoError, CryptoResult};
pub use hash::Hash;
pub use identity::{Fingerprint, Identity, PublicKey, Uid};

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Generate cryptographically secure random bytes
///
/// Fails only if the operating system RNG is unavailable, which callers
/// must treat as unrecoverable.
pub fn random_bytes<const N: usize>() -> CryptoResult<Zeroizing<[u8; N]>> {
    let mut bytes = Zeroizing::new([0u8; N]);
    fill_random(bytes.as_mut())?;
    Ok(bytes)
}

/// Fill `buf` from the operating system RNG
pub fn fill_random(buf: &mut [u8]) -> CryptoResult<()> {
    OsRng.try_fill_bytes(buf).map_err(|_| CryptoError::RngError)
}
