//! Errors from key handling and primitive operations

use thiserror::Error;

/// Failures of the RSA, hash and cipher layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A fixed-size buffer had the wrong length
    #[error("Wrong length: wanted {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Length supplied
        actual: usize,
    },

    /// RSA modulus size outside the accepted range
    #[error("Unsupported key size: {0} bits")]
    UnsupportedKeySize(u64),

    /// PSS signature did not verify
    #[error("Bad signature")]
    SignatureVerificationFailed,

    /// PSS signing failed
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// RSA key generation failed
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// OAEP encryption rejected the input
    #[error("OAEP encryption failed: {0}")]
    EncryptionFailed(String),

    /// OAEP padding did not check out under our key
    #[error("OAEP decryption failed")]
    DecryptionFailed,

    /// Public key bytes do not describe a usable RSA key
    #[error("Malformed public key")]
    InvalidPublicKey,

    /// Private key could not be loaded
    #[error("Malformed private key")]
    InvalidSecretKey,

    /// The OS random source failed
    #[error("OS random source unavailable")]
    RngError,
}

/// Result alias for this module
pub type CryptoResult<T> = Result<T, CryptoError>;
