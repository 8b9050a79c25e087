//! Outer frame codec
//!
//! Every frame exchanged with the relay starts with a type byte:
//!
//! ```text
//! 0x00  routed      type ++ uid(32) ++ BE64(body_len) ++ body
//! 0x01  lookup      request:  type ++ uid(32)
//!                   response: type ++ uid(32) ++ wire public key
//! 0xff  not found   type
//! ```
//!
//! On a routed frame the uid names the target when sent and the sender when
//! received; the relay rewrites it in between. The first byte of a routed
//! body is the [`InnerKind`].

use crate::crypto::identity::{wire_size, PublicKey};
use crate::crypto::Uid;

use super::reader::{WireError, WireReader, WireResult};

/// Routed user payload
pub const OUTER_ROUTED: u8 = 0x00;
/// Public-key lookup request or successful response
pub const OUTER_LOOKUP: u8 = 0x01;
/// Public-key lookup found no such user
pub const OUTER_NOT_FOUND: u8 = 0xff;

/// Size of a uid on the wire
pub const UID_LEN: usize = 32;
/// Size of a lookup request, `type ++ uid`
pub const LOOKUP_REQUEST_LEN: usize = 1 + UID_LEN;
/// Offset of the body in a routed frame
pub const ROUTED_HEADER_LEN: usize = 1 + UID_LEN + 8;

/// Kind byte at the start of a routed body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InnerKind {
    /// Conversation message between friends
    Conversation = 0,
    /// Friend request carrying a secure envelope
    FriendRequest = 1,
    /// Accepted friend request carrying a secure envelope and key material
    FriendResponse = 2,
}

impl InnerKind {
    /// The wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for InnerKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(InnerKind::Conversation),
            1 => Ok(InnerKind::FriendRequest),
            2 => Ok(InnerKind::FriendResponse),
            other => Err(other),
        }
    }
}

/// A decoded inbound payload, borrowing from the frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// User payload relayed from a peer
    Routed {
        /// The peer the relay says sent it
        sender: Uid,
        /// Inner kind byte followed by kind data
        body: &'a [u8],
    },
    /// Successful lookup response, the whole payload
    LookupReply(&'a [u8]),
    /// Lookup found nothing
    NotFound,
}

/// Outcome of a public-key lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The relay knows the user and returned their key
    Found(PublicKey),
    /// The relay has no such user
    NotFound,
}

/// Classify an inbound payload by its type byte
///
/// A routed frame whose declared body length disagrees with the payload is
/// reported as [`WireError::LengthMismatch`]. The relay is trusted, so the
/// caller treats that as fatal.
pub fn decode_inbound(payload: &[u8]) -> WireResult<Inbound<'_>> {
    let mut r = WireReader::new(payload);
    let ty = r.read_u8().map_err(|_| WireError::Empty)?;

    match ty {
        OUTER_ROUTED => {
            let (sender, body) = decode_routed(payload)?;
            Ok(Inbound::Routed { sender, body })
        }
        OUTER_LOOKUP => Ok(Inbound::LookupReply(payload)),
        OUTER_NOT_FOUND => Ok(Inbound::NotFound),
        other => Err(WireError::UnknownType(other)),
    }
}

/// Split a routed frame into its uid and body
pub fn decode_routed(payload: &[u8]) -> WireResult<(Uid, &[u8])> {
    let mut r = WireReader::new(payload);
    let ty = r.read_u8()?;
    if ty != OUTER_ROUTED {
        return Err(WireError::UnknownType(ty));
    }
    let uid = Uid(r.read_array::<UID_LEN>()?);
    let declared = r.read_be64()?;

    let actual = r.remaining() as u64;
    if declared != actual {
        return Err(WireError::LengthMismatch { declared, actual });
    }
    Ok((uid, r.rest()))
}

/// Build a routed frame addressed to `target`
pub fn encode_routed(target: &Uid, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ROUTED_HEADER_LEN + body.len());
    out.push(OUTER_ROUTED);
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Build the 33-byte lookup request for `uid`
pub fn encode_lookup_request(uid: &Uid) -> [u8; LOOKUP_REQUEST_LEN] {
    let mut out = [0u8; LOOKUP_REQUEST_LEN];
    out[0] = OUTER_LOOKUP;
    out[1..].copy_from_slice(uid.as_bytes());
    out
}

/// Parse a lookup request as the relay sees it
pub fn decode_lookup_request(payload: &[u8]) -> WireResult<Uid> {
    if payload.len() != LOOKUP_REQUEST_LEN {
        return Err(WireError::LengthMismatch {
            declared: LOOKUP_REQUEST_LEN as u64,
            actual: payload.len() as u64,
        });
    }
    let mut r = WireReader::new(payload);
    match r.read_u8()? {
        OUTER_LOOKUP => Ok(Uid(r.read_array::<UID_LEN>()?)),
        other => Err(WireError::UnknownType(other)),
    }
}

/// Build a successful lookup response
pub fn encode_lookup_found(uid: &Uid, key: &PublicKey) -> Vec<u8> {
    let wire = key.to_wire();
    let mut out = Vec::with_capacity(1 + UID_LEN + wire.len());
    out.push(OUTER_LOOKUP);
    out.extend_from_slice(uid.as_bytes());
    out.extend_from_slice(&wire);
    out
}

/// Build a lookup failure response
pub fn encode_not_found() -> Vec<u8> {
    vec![OUTER_NOT_FOUND]
}

/// Interpret a lookup reply taken from the mailbox
///
/// The type byte is checked first, so a not-found marker is accepted at
/// any length. A found reply must name `expected` and carry exactly one
/// well-formed public key. Every other shape is an error, which callers
/// treat as the relay misbehaving.
pub fn parse_lookup_reply(payload: &[u8], expected: &Uid) -> WireResult<LookupOutcome> {
    let mut r = WireReader::new(payload);
    match r.read_u8().map_err(|_| WireError::Empty)? {
        OUTER_NOT_FOUND => return Ok(LookupOutcome::NotFound),
        OUTER_LOOKUP => {}
        other => return Err(WireError::UnknownType(other)),
    }

    let uid = Uid(r.read_array::<UID_LEN>()?);
    let bits = r.read_be64()?;
    if uid != *expected {
        return Err(WireError::UidMismatch);
    }

    let expected_len = wire_size(bits).map_err(|_| WireError::BadPublicKey)?;
    let actual = (r.remaining() + 8) as u64;
    if actual != expected_len as u64 {
        return Err(WireError::LengthMismatch {
            declared: expected_len as u64,
            actual,
        });
    }

    let key = PublicKey::from_wire(&payload[1 + UID_LEN..]).map_err(|_| WireError::BadPublicKey)?;
    Ok(LookupOutcome::Found(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{alice, bob};

    #[test]
    fn test_lookup_request_layout() {
        let uid = Uid::from_username("alice");
        let frame = encode_lookup_request(&uid);

        assert_eq!(frame.len(), 0x21);
        assert_eq!(frame[0], 1);
        assert_eq!(&frame[1..], uid.as_bytes());
        assert_eq!(decode_lookup_request(&frame).unwrap(), uid);
    }

    #[test]
    fn test_routed_layout() {
        let target = Uid::from_username("bob");
        let frame = encode_routed(&target, b"\x01envelope");

        assert_eq!(frame[0], OUTER_ROUTED);
        assert_eq!(&frame[1..0x21], target.as_bytes());
        assert_eq!(&frame[0x21..0x29], &9u64.to_be_bytes());
        assert_eq!(frame[0x29], InnerKind::FriendRequest.as_u8());

        match decode_inbound(&frame).unwrap() {
            Inbound::Routed { sender, body } => {
                assert_eq!(sender, target);
                assert_eq!(body, b"\x01envelope");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_routed_length_lie_detected() {
        let mut frame = encode_routed(&Uid::from_username("bob"), b"body");
        frame[0x28] = 5;
        assert_eq!(
            decode_routed(&frame),
            Err(WireError::LengthMismatch {
                declared: 5,
                actual: 4
            })
        );

        frame.truncate(0x20);
        assert!(matches!(
            decode_routed(&frame),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_inbound_markers() {
        assert_eq!(decode_inbound(&[0xff]).unwrap(), Inbound::NotFound);
        assert_eq!(
            decode_inbound(&[0x01, 2, 3]).unwrap(),
            Inbound::LookupReply(&[0x01, 2, 3])
        );
        assert_eq!(decode_inbound(&[0x07]), Err(WireError::UnknownType(7)));
        assert_eq!(decode_inbound(&[]), Err(WireError::Empty));
    }

    #[test]
    fn test_lookup_reply_found() {
        let bob = bob();
        let reply = encode_lookup_found(&bob.uid(), bob.public_key());

        // type ++ uid ++ BE64(keylen) ++ key
        assert_eq!(&reply[0x21..0x29], &bob.public_key().bits().to_be_bytes());

        let outcome = parse_lookup_reply(&reply, &bob.uid()).unwrap();
        assert_eq!(outcome, LookupOutcome::Found(bob.public_key().clone()));
    }

    #[test]
    fn test_lookup_reply_not_found_any_length() {
        let uid = Uid::from_username("nobody");
        assert_eq!(
            parse_lookup_reply(&encode_not_found(), &uid).unwrap(),
            LookupOutcome::NotFound
        );
        assert_eq!(
            parse_lookup_reply(&[0xff, 1, 2, 3], &uid).unwrap(),
            LookupOutcome::NotFound
        );
    }

    #[test]
    fn test_lookup_reply_wrong_uid() {
        let bob = bob();
        let reply = encode_lookup_found(&bob.uid(), bob.public_key());
        assert_eq!(
            parse_lookup_reply(&reply, &alice().uid()),
            Err(WireError::UidMismatch)
        );
    }

    #[test]
    fn test_lookup_reply_bad_lengths() {
        let bob = bob();
        let reply = encode_lookup_found(&bob.uid(), bob.public_key());

        assert!(parse_lookup_reply(&reply[..0x20], &bob.uid()).is_err());
        assert!(parse_lookup_reply(&reply[..0x28], &bob.uid()).is_err());
        assert!(parse_lookup_reply(&reply[..reply.len() - 1], &bob.uid()).is_err());

        let mut long = reply.clone();
        long.push(0);
        assert!(parse_lookup_reply(&long, &bob.uid()).is_err());
    }

    #[test]
    fn test_inner_kind_conversion() {
        assert_eq!(InnerKind::try_from(2), Ok(InnerKind::FriendResponse));
        assert_eq!(InnerKind::try_from(9), Err(9));
    }
}
