//! The header of a DNS message.
//!
//! Each DNS message starts with a twelve octet header carrying the
//! transaction id, the flag bits and the number of entries in each of the
//! four sections that follow. Content and format are defined in section
//! 4.1.1 of [RFC 1035]:
//!
//! ```text
//!                                 1  1  1  1  1  1
//!   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                      ID                       |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |QR|   Opcode  |AA|TC|RD|RA|Z |AD|CD|   RCODE   |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    QDCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    ANCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    NSCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    ARCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```
//!
//! The types here are views over the first twelve octets of a message
//! buffer: [`Header`] for reading and [`HeaderMut`] for building. The AD
//! and CD flags come from [RFC 4035].
//!
//! [RFC 1035]: https://tools.ietf.org/html/rfc1035
//! [RFC 4035]: https://tools.ietf.org/html/rfc4035

use super::wire;
use super::ParseError;

/// Length of a message header in octets.
pub const HEADER_LEN: usize = 12;

//------------ Opcode --------------------------------------------------------

/// The kind of operation a message requests.
///
/// Only the operations the query builder can produce are modelled as
/// variants; everything else ends up in `Other` when read from the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Opcode {
    /// A standard query.
    Query,

    /// A zone change notification, RFC 1996.
    Notify,

    /// A dynamic update, RFC 2136.
    Update,

    /// Any other value found on the wire.
    Other(u8),
}

impl Opcode {
    /// Returns the opcode for a raw wire value.
    pub fn from_int(value: u8) -> Self {
        match value {
            0 => Opcode::Query,
            4 => Opcode::Notify,
            5 => Opcode::Update,
            value => Opcode::Other(value),
        }
    }

    /// Returns the raw wire value of the opcode.
    pub fn to_int(self) -> u8 {
        match self {
            Opcode::Query => 0,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Other(value) => value,
        }
    }
}

//------------ Header --------------------------------------------------------

/// A read-only view of a message header.
#[derive(Clone, Copy, Debug)]
pub struct Header<'a> {
    /// The underlying message octets.
    ///
    /// Only the first twelve octets are ever touched; construction
    /// guarantees they exist.
    octets: &'a [u8],
}

impl<'a> Header<'a> {
    /// Creates a header view for a message slice.
    ///
    /// Fails if the slice is shorter than a header.
    pub fn for_message_slice(octets: &'a [u8]) -> Result<Self, ParseError> {
        if octets.len() < HEADER_LEN {
            return Err(ParseError::ShortBuf);
        }
        Ok(Header { octets })
    }

    /// Returns the value of the ID field.
    pub fn id(&self) -> u16 {
        wire::get_u16(self.octets, 0).expect("validated length")
    }

    /// Returns whether the QR bit is set, i.e., the message is a response.
    pub fn qr(&self) -> bool {
        self.bit(2, 7)
    }

    /// Returns the value of the opcode field.
    pub fn opcode(&self) -> Opcode {
        Opcode::from_int((self.octets[2] >> 3) & 0x0f)
    }

    /// Returns whether the AA bit is set.
    pub fn aa(&self) -> bool {
        self.bit(2, 2)
    }

    /// Returns whether the TC bit is set, i.e., the response was truncated.
    pub fn tc(&self) -> bool {
        self.bit(2, 1)
    }

    /// Returns whether the RD bit is set.
    pub fn rd(&self) -> bool {
        self.bit(2, 0)
    }

    /// Returns whether the RA bit is set.
    pub fn ra(&self) -> bool {
        self.bit(3, 7)
    }

    /// Returns whether the AD bit is set.
    pub fn ad(&self) -> bool {
        self.bit(3, 5)
    }

    /// Returns whether the CD bit is set.
    pub fn cd(&self) -> bool {
        self.bit(3, 4)
    }

    /// Returns the value of the rcode field.
    pub fn rcode(&self) -> u8 {
        self.octets[3] & 0x0f
    }

    /// Returns the number of entries in the question section.
    pub fn qdcount(&self) -> u16 {
        wire::get_u16(self.octets, 4).expect("validated length")
    }

    /// Returns the number of entries in the answer section.
    pub fn ancount(&self) -> u16 {
        wire::get_u16(self.octets, 6).expect("validated length")
    }

    /// Returns the number of entries in the authority section.
    pub fn nscount(&self) -> u16 {
        wire::get_u16(self.octets, 8).expect("validated length")
    }

    /// Returns the number of entries in the additional section.
    pub fn arcount(&self) -> u16 {
        wire::get_u16(self.octets, 10).expect("validated length")
    }

    /// Returns a single flag bit.
    fn bit(&self, octet: usize, bit: usize) -> bool {
        self.octets[octet] & (1 << bit) != 0
    }
}

//------------ HeaderMut -----------------------------------------------------

/// A mutable view of a message header, used while building.
#[derive(Debug)]
pub struct HeaderMut<'a> {
    /// The underlying message octets.
    octets: &'a mut [u8],
}

impl<'a> HeaderMut<'a> {
    /// Creates a mutable header view for a message slice.
    ///
    /// # Panics
    ///
    /// Panics if the slice is shorter than a header. The builder allocates
    /// the header before anything else, so this is an internal contract
    /// rather than an input check.
    pub fn for_message_slice(octets: &'a mut [u8]) -> Self {
        assert!(octets.len() >= HEADER_LEN);
        HeaderMut { octets }
    }

    /// Sets the value of the ID field.
    pub fn set_id(&mut self, value: u16) {
        wire::put_u16(self.octets, 0, value)
    }

    /// Sets the QR bit.
    pub fn set_qr(&mut self, set: bool) {
        self.set_bit(2, 7, set)
    }

    /// Sets the opcode field.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.octets[2] =
            (self.octets[2] & 0x87) | ((opcode.to_int() & 0x0f) << 3);
    }

    /// Sets the TC bit.
    pub fn set_tc(&mut self, set: bool) {
        self.set_bit(2, 1, set)
    }

    /// Sets the RD bit.
    pub fn set_rd(&mut self, set: bool) {
        self.set_bit(2, 0, set)
    }

    /// Sets the AD bit.
    pub fn set_ad(&mut self, set: bool) {
        self.set_bit(3, 5, set)
    }

    /// Sets the CD bit.
    pub fn set_cd(&mut self, set: bool) {
        self.set_bit(3, 4, set)
    }

    /// Sets the rcode field.
    pub fn set_rcode(&mut self, rcode: u8) {
        self.octets[3] = (self.octets[3] & 0xf0) | (rcode & 0x0f);
    }

    /// Sets the number of entries in the question section.
    pub fn set_qdcount(&mut self, value: u16) {
        wire::put_u16(self.octets, 4, value)
    }

    /// Sets the number of entries in the answer section.
    pub fn set_ancount(&mut self, value: u16) {
        wire::put_u16(self.octets, 6, value)
    }

    /// Sets the number of entries in the additional section.
    pub fn set_arcount(&mut self, value: u16) {
        wire::put_u16(self.octets, 10, value)
    }

    /// Increments the additional section count by one.
    pub fn bump_arcount(&mut self) {
        let count = wire::get_u16(self.octets, 10).expect("validated length");
        wire::put_u16(self.octets, 10, count + 1)
    }

    /// Sets or clears a single flag bit.
    fn set_bit(&mut self, octet: usize, bit: usize, set: bool) {
        if set {
            self.octets[octet] |= 1 << bit
        } else {
            self.octets[octet] &= !(1 << bit)
        }
    }
}

//============ Testing ======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_roundtrip() {
        let mut buf = [0u8; HEADER_LEN];
        {
            let mut header = HeaderMut::for_message_slice(&mut buf);
            header.set_id(0x8001);
            header.set_opcode(Opcode::Notify);
            header.set_rd(true);
            header.set_ad(true);
            header.set_cd(true);
            header.set_rcode(3);
            header.set_qdcount(1);
            header.set_arcount(2);
        }
        let header = Header::for_message_slice(&buf).unwrap();
        assert_eq!(header.id(), 0x8001);
        assert_eq!(header.opcode(), Opcode::Notify);
        assert!(!header.qr());
        assert!(header.rd());
        assert!(header.ad());
        assert!(header.cd());
        assert!(!header.tc());
        assert_eq!(header.rcode(), 3);
        assert_eq!(header.qdcount(), 1);
        assert_eq!(header.ancount(), 0);
        assert_eq!(header.arcount(), 2);
    }

    #[test]
    fn opcode_preserves_neighbour_bits() {
        let mut buf = [0u8; HEADER_LEN];
        {
            let mut header = HeaderMut::for_message_slice(&mut buf);
            header.set_qr(true);
            header.set_rd(true);
            header.set_opcode(Opcode::Update);
        }
        let header = Header::for_message_slice(&buf).unwrap();
        assert!(header.qr());
        assert!(header.rd());
        assert_eq!(header.opcode(), Opcode::Update);
    }

    #[test]
    fn short_slice() {
        assert!(Header::for_message_slice(&[0u8; 11]).is_err());
    }
}
