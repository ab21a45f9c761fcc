//! Wire-format primitives.
//!
//! The submodules cover the parts of the wire format the query lifecycle
//! needs: the fixed header, domain-name compression and decompression,
//! question entries and network-byte-order integers. Record data beyond
//! the raw rdata octets is deliberately not interpreted here.

pub mod header;
pub mod name;
pub mod question;
pub mod wire;

use thiserror::Error;

//------------ ParseError ----------------------------------------------------

/// A message failed to parse.
///
/// Parse errors never surface to user code on their own: a response that
/// does not parse is simply not a match for any outstanding query and gets
/// dropped. Only a reply that arrived over TCP, and thus was solicited for
/// certain, escalates a parse failure into `Error::ProtocolError`.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ParseError {
    /// The message ended before the parsed structure did.
    #[error("unexpected end of message")]
    ShortBuf,

    /// A compression pointer pointed forward or at itself.
    #[error("bad compression pointer")]
    BadPointer,

    /// A label started with the reserved `0x40` or `0x80` type bits.
    #[error("reserved label type")]
    BadLabel,

    /// A decompressed name exceeded 255 octets.
    #[error("domain name exceeds 255 octets")]
    LongName,
}
