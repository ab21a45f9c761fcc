//! A read-only view of a received message.
//!
//! [`Response`] borrows the received octets and exposes the header fields
//! and section iterators the matcher and user handlers need. Record data
//! is handed out as raw octets; interpreting rdata per record type is the
//! caller's business.

use crate::base::header::{Header, Opcode};
use crate::base::name;
use crate::base::question::Question;
use crate::base::{wire, ParseError};

/// The rcode signalling that the queried name does not exist.
pub const RCODE_NXDOMAIN: u8 = 3;

//------------ Section -------------------------------------------------------

/// The three record sections of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Section {
    /// The answer section.
    Answer,

    /// The authority section.
    Authority,

    /// The additional section.
    Additional,
}

//------------ Response ------------------------------------------------------

/// A borrowed view of a received DNS message.
#[derive(Clone, Copy, Debug)]
pub struct Response<'a> {
    /// The received octets.
    octets: &'a [u8],
}

impl<'a> Response<'a> {
    /// Creates a view if the octets hold at least a well-formed header.
    pub fn parse(octets: &'a [u8]) -> Result<Self, ParseError> {
        Header::for_message_slice(octets)?;
        Ok(Response { octets })
    }

    /// Returns the raw octets of the message.
    pub fn as_slice(&self) -> &'a [u8] {
        self.octets
    }

    /// Returns the message header.
    pub fn header(&self) -> Header<'a> {
        Header::for_message_slice(self.octets).expect("validated header")
    }

    /// Returns the transaction id.
    pub fn id(&self) -> u16 {
        self.header().id()
    }

    /// Returns the opcode.
    pub fn opcode(&self) -> Opcode {
        self.header().opcode()
    }

    /// Returns the response code.
    pub fn rcode(&self) -> u8 {
        self.header().rcode()
    }

    /// Returns whether the response is truncated.
    pub fn truncated(&self) -> bool {
        self.header().tc()
    }

    /// Returns the number of entries in the question section.
    pub fn qdcount(&self) -> u16 {
        self.header().qdcount()
    }

    /// Returns the declared number of records in a section.
    pub fn count(&self, section: Section) -> u16 {
        match section {
            Section::Answer => self.header().ancount(),
            Section::Authority => self.header().nscount(),
            Section::Additional => self.header().arcount(),
        }
    }

    /// Returns an iterator over the question section.
    pub fn questions(&self) -> Questions<'a> {
        Questions {
            octets: self.octets,
            pos: crate::base::header::HEADER_LEN,
            remaining: self.qdcount(),
        }
    }

    /// Returns an iterator over the records of a section.
    ///
    /// Reaching a section requires walking everything before it, which can
    /// fail on a malformed message.
    pub fn records(
        &self,
        section: Section,
    ) -> Result<Records<'a>, ParseError> {
        let mut pos = crate::base::header::HEADER_LEN;
        for _ in 0..self.qdcount() {
            let (_, consumed) = Question::parse(self.octets, pos)?;
            pos += consumed;
        }
        let mut skip = 0u32;
        let remaining = match section {
            Section::Answer => self.header().ancount(),
            Section::Authority => {
                skip = u32::from(self.header().ancount());
                self.header().nscount()
            }
            Section::Additional => {
                skip = u32::from(self.header().ancount())
                    + u32::from(self.header().nscount());
                self.header().arcount()
            }
        };
        for _ in 0..skip {
            let (_, consumed) = parse_record(self.octets, pos)?;
            pos += consumed;
        }
        Ok(Records {
            octets: self.octets,
            pos,
            remaining,
        })
    }
}

//------------ Record --------------------------------------------------------

/// One resource record, with its data left raw.
#[derive(Clone, Debug)]
pub struct Record<'a> {
    /// The owner name.
    name: String,

    /// The record type.
    rtype: u16,

    /// The class.
    class: u16,

    /// The time to live.
    ttl: u32,

    /// The record data.
    rdata: &'a [u8],
}

impl<'a> Record<'a> {
    /// Returns the owner name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the record type.
    pub fn rtype(&self) -> u16 {
        self.rtype
    }

    /// Returns the class.
    pub fn class(&self) -> u16 {
        self.class
    }

    /// Returns the time to live.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Returns the raw record data.
    pub fn rdata(&self) -> &'a [u8] {
        self.rdata
    }
}

/// Parses the record at `pos`, returning it and the octets consumed.
fn parse_record(
    octets: &[u8],
    pos: usize,
) -> Result<(Record, usize), ParseError> {
    let parsed = name::decompress(octets, pos)?;
    let after = pos + parsed.consumed();
    let rtype = wire::get_u16(octets, after)?;
    let class = wire::get_u16(octets, after + 2)?;
    let ttl = wire::get_u32(octets, after + 4)?;
    let rdlen = usize::from(wire::get_u16(octets, after + 8)?);
    let rdata = octets
        .get(after + 10..after + 10 + rdlen)
        .ok_or(ParseError::ShortBuf)?;
    Ok((
        Record {
            name: parsed.name().into(),
            rtype,
            class,
            ttl,
            rdata,
        },
        parsed.consumed() + 10 + rdlen,
    ))
}

//------------ Questions -----------------------------------------------------

/// An iterator over the question section.
///
/// Stops at the declared count or at the end of the message, whichever
/// comes first; a parse failure is yielded once and ends the iteration.
#[derive(Clone, Debug)]
pub struct Questions<'a> {
    /// The message octets.
    octets: &'a [u8],

    /// Position of the next entry.
    pos: usize,

    /// Entries left according to the header.
    remaining: u16,
}

impl<'a> Iterator for Questions<'a> {
    type Item = Result<Question, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match Question::parse(self.octets, self.pos) {
            Ok((question, consumed)) => {
                self.pos += consumed;
                self.remaining -= 1;
                Some(Ok(question))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

//------------ Records -------------------------------------------------------

/// An iterator over the records of one section.
#[derive(Clone, Debug)]
pub struct Records<'a> {
    /// The message octets.
    octets: &'a [u8],

    /// Position of the next record.
    pos: usize,

    /// Records left according to the header.
    remaining: u16,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match parse_record(self.octets, self.pos) {
            Ok((record, consumed)) => {
                self.pos += consumed;
                self.remaining -= 1;
                Some(Ok(record))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

//============ Testing ======================================================
