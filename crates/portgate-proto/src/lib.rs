//! Registration protocol definitions
//!
//! A device announces itself on the discovery port with a single frame:
//! a big-endian `u16` length followed by that many bytes of JSON header.
//! No response is sent; the same connection then carries raw relayed bytes.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, RegistrationCodec};
pub use messages::RegistrationHeader;

/// Size of the length prefix in front of the registration header
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest header that fits behind a `u16` length prefix
pub const MAX_HEADER_SIZE: usize = u16::MAX as usize;
