//! RSA-secured handshake envelope
//!
//! ```text
//! kind(1) ++ BE64(kb) ++ BE64(db) ++ enc_block(kb) ++ data_block(db) ++ signature
//!
//! enc_block  = OAEP(recipient, symm_key(32) ++ hmac_key(32))
//! data_block = ChaCha20(symm_key, payload) ++ HMAC-SHA256(hmac_key, ciphertext)
//! payload    = BE64(ulen) ++ BE64(klen) ++ username ++ sender_key ++ extra
//! signature  = PSS(sender, everything before it)
//! ```
//!
//! The symmetric key is drawn fresh for every envelope and the stream cipher
//! runs with a zero nonce. Reusing a key across two envelopes would expose
//! both plaintexts, so keys never outlive a single build or parse.
//!
//! Parsing distinguishes input that failed a validity check
//! ([`Parsed::Invalid`]), which is expected from untrusted peers, from local
//! primitive failures (`Err`).

use std::mem;

use zeroize::Zeroizing;

use crate::crypto::cipher::KEY_SIZE;
use crate::crypto::hash::TAG_SIZE;
use crate::crypto::{
    random_bytes, CryptoError, CryptoResult, Hash, Identity, PublicKey, StreamCipher,
};

use super::frame::InnerKind;
use super::reader::WireReader;

/// `kind ++ BE64(kb) ++ BE64(db)`
pub const ENVELOPE_HEADER_LEN: usize = 1 + 8 + 8;

/// Random key material wrapped in the enc block: symmetric key then HMAC key
pub const WRAPPED_KEY_LEN: usize = 2 * KEY_SIZE;

const PAYLOAD_PREFIX_LEN: usize = 16;

/// Why a received envelope was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Header missing or block lengths exceed the frame
    Truncated,
    /// Kind byte is not a handshake kind
    UnknownKind(u8),
    /// The enc block did not decrypt under our key
    UnwrapFailed,
    /// HMAC tag mismatch
    BadTag,
    /// Decrypted payload is not well formed
    MalformedPayload,
    /// Embedded sender key is not a valid public key
    BadSenderKey,
    /// Frame length disagrees with the sender's signature size
    LengthMismatch,
    /// Signature does not verify under the embedded sender key
    BadSignature,
}

/// Authenticated contents of a valid envelope
#[derive(Clone, PartialEq, Eq)]
pub struct EnvelopeFields {
    /// Envelope kind
    pub kind: InnerKind,
    /// Sender's username as they claim it
    pub username: String,
    /// Sender's long-term key, which signed the envelope
    pub public_key: PublicKey,
    /// Kind-specific data following the sender key
    pub extra: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for EnvelopeFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeFields")
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("public_key", &self.public_key)
            .field("extra_len", &self.extra.len())
            .finish()
    }
}

/// Result of parsing an envelope from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Every check passed
    Valid(EnvelopeFields),
    /// A validity check failed
    Invalid(Rejection),
}

/// Build a signed envelope of `kind` from `sender` to `recipient`
///
/// Nothing is returned unless every step succeeds. All key material and
/// plaintext is wiped before returning, on every path.
pub fn make_secure_envelope(
    kind: InnerKind,
    sender: &Identity,
    recipient: &PublicKey,
    extra: &[u8],
) -> CryptoResult<Vec<u8>> {
    let keys = random_bytes::<WRAPPED_KEY_LEN>()?;
    let (symm_key, hmac_key) = split_keys(keys.as_ref());

    let enc_block = recipient.encrypt_oaep(keys.as_ref())?;

    let username = sender.username().as_bytes();
    let sender_key = sender.public_key().to_wire();
    let payload_len = PAYLOAD_PREFIX_LEN + username.len() + sender_key.len() + extra.len();
    let data_len = payload_len + TAG_SIZE;
    let total = ENVELOPE_HEADER_LEN + enc_block.len() + data_len + sender.public_key().size();

    let mut frame = Zeroizing::new(Vec::with_capacity(total));
    frame.push(kind.as_u8());
    frame.extend_from_slice(&(enc_block.len() as u64).to_be_bytes());
    frame.extend_from_slice(&(data_len as u64).to_be_bytes());
    frame.extend_from_slice(&enc_block);

    let payload_start = frame.len();
    frame.extend_from_slice(&(username.len() as u64).to_be_bytes());
    frame.extend_from_slice(&(sender_key.len() as u64).to_be_bytes());
    frame.extend_from_slice(username);
    frame.extend_from_slice(&sender_key);
    frame.extend_from_slice(extra);

    StreamCipher::apply_keystream(&symm_key, &mut frame[payload_start..]);
    let tag = Hash::hmac(&hmac_key[..], &frame[payload_start..])?;
    frame.extend_from_slice(&tag);

    let signature = sender.sign_pss(&frame)?;
    frame.extend_from_slice(&signature);

    Ok(mem::take(&mut *frame))
}

/// Parse and authenticate an envelope addressed to `own`
///
/// The signature is checked over the frame exactly as received, so the
/// ciphertext it covers is the transmitted ciphertext.
pub fn parse_secure_envelope(frame: &[u8], own: &Identity) -> CryptoResult<Parsed> {
    let mut r = WireReader::new(frame);
    let Some((kind, kb_len, db_len)) = read_header(&mut r) else {
        return Ok(Parsed::Invalid(Rejection::Truncated));
    };

    let kind = match InnerKind::try_from(kind) {
        Ok(k @ (InnerKind::FriendRequest | InnerKind::FriendResponse)) => k,
        Ok(other) => return Ok(Parsed::Invalid(Rejection::UnknownKind(other.as_u8()))),
        Err(other) => return Ok(Parsed::Invalid(Rejection::UnknownKind(other))),
    };

    let bounded = ENVELOPE_HEADER_LEN
        .checked_add(kb_len)
        .and_then(|n| n.checked_add(db_len))
        .is_some_and(|n| n < frame.len());
    if !bounded || db_len < TAG_SIZE {
        return Ok(Parsed::Invalid(Rejection::Truncated));
    }

    let (enc_block, data_block) = match (r.read_bytes(kb_len), r.read_bytes(db_len)) {
        (Ok(e), Ok(d)) => (e, d),
        _ => return Ok(Parsed::Invalid(Rejection::Truncated)),
    };
    let signature = r.rest();

    if enc_block.len() != own.public_key().size() {
        return Ok(Parsed::Invalid(Rejection::UnwrapFailed));
    }
    let keys = match own.decrypt_oaep(enc_block) {
        Ok(keys) if keys.len() == WRAPPED_KEY_LEN => keys,
        Ok(_) | Err(CryptoError::DecryptionFailed) => {
            return Ok(Parsed::Invalid(Rejection::UnwrapFailed))
        }
        Err(e) => return Err(e),
    };
    let (symm_key, hmac_key) = split_keys(&keys);

    let (ciphertext, tag) = data_block.split_at(db_len - TAG_SIZE);
    if !Hash::verify_hmac(&hmac_key[..], ciphertext, tag)? {
        return Ok(Parsed::Invalid(Rejection::BadTag));
    }

    let mut payload = Zeroizing::new(ciphertext.to_vec());
    StreamCipher::apply_keystream(&symm_key, &mut payload);

    let Some((username, public_key, extra)) = split_payload(&payload) else {
        return Ok(Parsed::Invalid(Rejection::MalformedPayload));
    };
    let Ok(username) = std::str::from_utf8(username) else {
        return Ok(Parsed::Invalid(Rejection::MalformedPayload));
    };
    let Ok(public_key) = PublicKey::from_wire(public_key) else {
        return Ok(Parsed::Invalid(Rejection::BadSenderKey));
    };

    if signature.len() != public_key.size() {
        return Ok(Parsed::Invalid(Rejection::LengthMismatch));
    }
    let signed = &frame[..frame.len() - signature.len()];
    if public_key.verify_pss(signed, signature).is_err() {
        return Ok(Parsed::Invalid(Rejection::BadSignature));
    }

    Ok(Parsed::Valid(EnvelopeFields {
        kind,
        username: username.to_string(),
        public_key,
        extra: Zeroizing::new(extra.to_vec()),
    }))
}

fn read_header(r: &mut WireReader<'_>) -> Option<(u8, usize, usize)> {
    Some((r.read_u8().ok()?, r.read_len().ok()?, r.read_len().ok()?))
}

fn split_keys(keys: &[u8]) -> (Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>) {
    let mut symm = Zeroizing::new([0u8; KEY_SIZE]);
    let mut hmac = Zeroizing::new([0u8; KEY_SIZE]);
    symm.copy_from_slice(&keys[..KEY_SIZE]);
    hmac.copy_from_slice(&keys[KEY_SIZE..WRAPPED_KEY_LEN]);
    (symm, hmac)
}

fn split_payload(payload: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let mut r = WireReader::new(payload);
    let ulen = r.read_len().ok()?;
    let klen = r.read_len().ok()?;
    let username = r.read_bytes(ulen).ok()?;
    let key = r.read_bytes(klen).ok()?;
    Some((username, key, r.rest()))
}
