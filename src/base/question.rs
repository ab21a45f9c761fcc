//! Question section entries.

use super::name;
use super::{wire, ParseError};

/// The class value for the Internet, the only class in practical use.
pub const CLASS_IN: u16 = 1;

//------------ Question ------------------------------------------------------

/// One entry of a question section.
///
/// The name is materialized during parsing so that the entry can be
/// compared independently of the message it came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    /// The domain name asked about.
    name: String,

    /// The requested record type.
    qtype: u16,

    /// The requested class.
    qclass: u16,
}

impl Question {
    /// Creates a question from its parts.
    pub fn new(name: String, qtype: u16, qclass: u16) -> Self {
        Question { name, qtype, qclass }
    }

    /// Parses the question at `pos`, returning it and the octets consumed.
    pub fn parse(
        packet: &[u8],
        pos: usize,
    ) -> Result<(Self, usize), ParseError> {
        let parsed = name::decompress(packet, pos)?;
        let after = pos + parsed.consumed();
        let qtype = wire::get_u16(packet, after)?;
        let qclass = wire::get_u16(packet, after + 2)?;
        Ok((
            Question::new(parsed.name().into(), qtype, qclass),
            parsed.consumed() + 4,
        ))
    }

    /// Returns the domain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the record type.
    pub fn qtype(&self) -> u16 {
        self.qtype
    }

    /// Returns the class.
    pub fn qclass(&self) -> u16 {
        self.qclass
    }

    /// Compares with another question, the name case-insensitively.
    pub fn matches(&self, other: &Question) -> bool {
        self.qtype == other.qtype
            && self.qclass == other.qclass
            && name::eq_ignore_case(&self.name, &other.name)
    }
}

//============ Testing ======================================================
