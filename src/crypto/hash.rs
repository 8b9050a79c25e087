//! SHA-256 hashing and HMAC-SHA256 authentication

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::error::{CryptoError, CryptoResult};

/// Size of a hash output in bytes
pub const HASH_SIZE: usize = 32;

/// Size of an HMAC-SHA256 tag in bytes
pub const TAG_SIZE: usize = 32;

/// A hash output
pub type HashOutput = [u8; HASH_SIZE];

/// Hashing and message authentication operations
pub struct Hash;

impl Hash {
    /// Compute SHA-256 of data
    pub fn sha256(data: &[u8]) -> HashOutput {
        Sha256::digest(data).into()
    }

    /// Compute HMAC-SHA256 of `data` under `key`
    pub fn hmac(key: &[u8], data: &[u8]) -> CryptoResult<[u8; TAG_SIZE]> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: HASH_SIZE,
                actual: key.len(),
            }
        })?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Check an HMAC-SHA256 tag in constant time
    pub fn verify_hmac(key: &[u8], data: &[u8], tag: &[u8]) -> CryptoResult<bool> {
        let expected = Self::hmac(key, data)?;
        if tag.len() != TAG_SIZE {
            return Ok(false);
        }
        Ok(expected.ct_eq(tag).unwrap_u8() == 1)
    }

    /// Compute SHA-256 and return it as a hex string
    pub fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Self::sha256(data))
    }
}
