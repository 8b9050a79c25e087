//! RSA identity management
//!
//! Every user owns a long-term RSA key pair. The public half travels on the
//! wire in a fixed encoding and is addressed through the user's [`Uid`].
//! OAEP wraps per-message keys for a recipient, PSS authenticates whole
//! envelopes. Both use SHA-256.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::error::{CryptoError, CryptoResult};
use super::hash::{Hash, HASH_SIZE};

/// Smallest accepted RSA modulus in bits
///
/// OAEP-SHA256 must be able to wrap the 64 bytes of envelope key material.
pub const MIN_KEY_BITS: u64 = 1536;

/// Largest accepted RSA modulus in bits
pub const MAX_KEY_BITS: u64 = 4096;

/// Number of bytes used by the two length fields of the wire encoding
const WIRE_OVERHEAD: usize = 16;

/// Size in bytes of a wire-encoded public key with the given modulus size
pub fn wire_size(bits: u64) -> CryptoResult<usize> {
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
        return Err(CryptoError::UnsupportedKeySize(bits));
    }
    Ok(WIRE_OVERHEAD + bits.div_ceil(8) as usize)
}

/// Stable user identifier: `SHA256(username ++ 0x00)`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub [u8; HASH_SIZE]);

impl Uid {
    /// Derive the uid of a username
    pub fn from_username(username: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update([0u8]);
        Uid(hasher.finalize().into())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: HASH_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Uid(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Convert to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Uid({}...)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// SHA-256 of a wire-encoded public key, compared out of band by humans
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint(pub [u8; HASH_SIZE]);

impl Fingerprint {
    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A long-term RSA public key
///
/// Wire encoding: `BE64(bits) ++ modulus (ceil(bits/8) bytes) ++ BE64(e)`.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: RsaPublicKey,
}

impl PublicKey {
    /// Decode a wire-encoded public key
    ///
    /// The input must be exactly one key with no trailing bytes.
    pub fn from_wire(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < 8 {
            return Err(CryptoError::InvalidPublicKey);
        }
        let bits = read_be64(&bytes[..8]);
        let expected = wire_size(bits)?;
        if bytes.len() != expected {
            return Err(CryptoError::InvalidKeyLength {
                expected,
                actual: bytes.len(),
            });
        }

        let modulus = &bytes[8..expected - 8];
        let exponent = read_be64(&bytes[expected - 8..]);

        let n = BigUint::from_bytes_be(modulus);
        if n.bits() as u64 != bits {
            return Err(CryptoError::InvalidPublicKey);
        }
        let key = RsaPublicKey::new(n, BigUint::from(exponent))
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        Ok(PublicKey { key })
    }

    /// Encode to the wire format
    pub fn to_wire(&self) -> Vec<u8> {
        let bits = self.bits();
        let size = self.size();

        let mut out = Vec::with_capacity(WIRE_OVERHEAD + size);
        out.extend_from_slice(&bits.to_be_bytes());

        let n = self.key.n().to_bytes_be();
        out.resize(8 + size - n.len(), 0);
        out.extend_from_slice(&n);

        let e = self.key.e().to_bytes_be();
        let mut exponent = [0u8; 8];
        exponent[8 - e.len()..].copy_from_slice(&e);
        out.extend_from_slice(&exponent);
        out
    }

    /// Modulus size in bits
    pub fn bits(&self) -> u64 {
        self.key.n().bits() as u64
    }

    /// Modulus size in bytes: the length of OAEP ciphertexts and PSS signatures
    pub fn size(&self) -> usize {
        self.key.size()
    }

    /// SHA-256 of the wire encoding
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(Hash::sha256(&self.to_wire()))
    }

    /// RSA-OAEP (SHA-256) encrypt a short message to this key
    pub fn encrypt_oaep(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Verify an RSA-PSS (SHA-256) signature over `message`
    pub fn verify_pss(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        if signature.len() != self.size() {
            return Err(CryptoError::SignatureVerificationFailed);
        }
        let digest = Sha256::digest(message);
        self.key
            .verify(Pss::new::<Sha256>(), &digest, signature)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PublicKey({} bits, {}...)",
            self.bits(),
            &self.fingerprint().to_hex()[..16]
        )
    }
}

/// A user's cryptographic identity: username plus RSA private key
///
/// The private key is zeroized when dropped.
#[derive(Clone)]
pub struct Identity {
    username: String,
    uid: Uid,
    private_key: RsaPrivateKey,
    public_key: PublicKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate(username: &str, bits: usize) -> CryptoResult<Self> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&(bits as u64)) {
            return Err(CryptoError::UnsupportedKeySize(bits as u64));
        }
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;
        Self::from_private_key(username, private_key)
    }

    /// Wrap an existing RSA private key
    pub fn from_private_key(username: &str, private_key: RsaPrivateKey) -> CryptoResult<Self> {
        let public_key = PublicKey {
            key: private_key.to_public_key(),
        };
        // Reject keys we could not publish
        wire_size(public_key.bits())?;
        if public_key.key.e().bits() > 64 {
            return Err(CryptoError::InvalidSecretKey);
        }

        Ok(Identity {
            username: username.to_string(),
            uid: Uid::from_username(username),
            private_key,
            public_key,
        })
    }

    /// Import from a PKCS#8 PEM private key
    pub fn from_pkcs8_pem(username: &str, pem: &str) -> CryptoResult<Self> {
        let private_key =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| CryptoError::InvalidSecretKey)?;
        Self::from_private_key(username, private_key)
    }

    /// Export the private key as PKCS#8 PEM
    ///
    /// WARNING: This exposes the secret key. Handle with extreme care.
    pub fn to_pkcs8_pem(&self) -> CryptoResult<Zeroizing<String>> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|_| CryptoError::InvalidSecretKey)
    }

    /// Get the username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Get the uid derived from the username
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Fingerprint of our own public key
    pub fn fingerprint(&self) -> Fingerprint {
        self.public_key.fingerprint()
    }

    /// RSA-OAEP (SHA-256) decrypt a block addressed to us
    ///
    /// Any padding failure is reported as [`CryptoError::DecryptionFailed`].
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        match self
            .private_key
            .decrypt_blinded(&mut OsRng, Oaep::new::<Sha256>(), ciphertext)
        {
            Ok(plaintext) => Ok(Zeroizing::new(plaintext)),
            Err(rsa::Error::Decryption) => Err(CryptoError::DecryptionFailed),
            Err(e) => Err(CryptoError::EncryptionFailed(e.to_string())),
        }
    }

    /// RSA-PSS (SHA-256) sign `message`
    pub fn sign_pss(&self, message: &[u8]) -> CryptoResult<Vec<u8>> {
        let digest = Sha256::digest(message);
        self.private_key
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("uid", &self.uid)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

fn read_be64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}
