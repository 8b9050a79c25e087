//! Wire formats
//!
//! - `reader`: bounds-checked cursor used for all untrusted input
//! - `frame`: outer frames exchanged with the relay
//! - `envelope`: the RSA-secured friend handshake envelope

pub mod envelope;
pub mod frame;
pub mod reader;

pub use envelope::{
    make_secure_envelope, parse_secure_envelope, EnvelopeFields, Parsed, Rejection,
};
pub use frame::{Inbound, InnerKind, LookupOutcome};
pub use reader::{WireError, WireReader, WireResult};
