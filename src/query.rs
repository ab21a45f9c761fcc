//! Building outbound messages.
//!
//! A [`Query`] is the wire form of one outbound message. It is built once
//! per candidate name and re-sent verbatim across attempts: a fixed
//! twelve octet header, exactly one question, and, unless the legacy
//! message size is in effect, an EDNS(0) OPT pseudo-record as the last
//! entry of the additional section (RFC 6891).
//!
//! The type also owns the matching side: [`Query::matches`] decides
//! whether a received message is the answer to this query. A parse
//! failure while checking is a no-match, never an error; garbage received
//! on a socket must not disturb the operation waiting on it.

use bytes::{BufMut, BytesMut};

use crate::base::header::{HeaderMut, Opcode, HEADER_LEN};
use crate::base::name::Compressor;
use crate::base::question::{Question, CLASS_IN};
use crate::bits::Bits;
use crate::error::Error;
use crate::response::Response;

/// The record type of the EDNS OPT pseudo-record.
const TYPE_OPT: u16 = 41;

/// The record type of the NULL record carried in a notify payload.
const TYPE_NULL: u16 = 10;

/// The record type asked about in a notify message.
pub const TYPE_SOA: u16 = 6;

/// The DO flag inside the OPT ttl field.
const OPT_DNSSEC_OK: u16 = 0x8000;

/// The message size every server must accept without EDNS.
const LEGACY_SIZE: u16 = 512;

//------------ Query ---------------------------------------------------------

/// An outbound DNS message.
#[derive(Clone, Debug)]
pub struct Query {
    /// The wire form of the message.
    buf: BytesMut,
}

impl Query {
    /// Builds a message.
    ///
    /// `opcode` must be [`Opcode::Query`] or [`Opcode::Notify`]; `data`
    /// carries the optional notify payload name and is ignored for
    /// queries. The transaction id is allocated by the caller so that id
    /// generation stays injectable. `payload_size` bounds the buffer and
    /// is advertised through EDNS.
    pub(crate) fn build(
        opcode: Opcode,
        dname: &str,
        qtype: u16,
        bits: Bits,
        data: Option<&str>,
        id: u16,
        payload_size: u16,
    ) -> Result<Self, Error> {
        let payload_size = payload_size.max(LEGACY_SIZE);
        let limit = usize::from(payload_size);
        let mut buf = BytesMut::with_capacity(limit);
        buf.resize(HEADER_LEN, 0);

        {
            let mut header = HeaderMut::for_message_slice(&mut buf);
            header.set_id(id);
            header.set_opcode(opcode);
            header.set_rd(bits.rd());
            header.set_ad(bits.ad());
            header.set_cd(bits.cd());
            header.set_rcode(0);
            header.set_qdcount(1);
        }

        let mut compressor = Compressor::new();
        compressor
            .append(dname, &mut buf, limit)
            .map_err(|err| Error::InvalidQuery(err.to_string()))?;
        if buf.len() + 4 > limit {
            return Err(Error::InvalidQuery("message buffer exhausted".into()));
        }
        buf.put_u16(qtype);
        buf.put_u16(CLASS_IN);

        // A notify may carry a completion name as a NULL record in the
        // additional section.
        if opcode == Opcode::Notify {
            if let Some(data) = data {
                compressor
                    .append(data, &mut buf, limit)
                    .map_err(|err| Error::InvalidQuery(err.to_string()))?;
                if buf.len() + 10 > limit {
                    return Err(Error::InvalidQuery(
                        "message buffer exhausted".into(),
                    ));
                }
                buf.put_u16(TYPE_NULL);
                buf.put_u16(CLASS_IN);
                buf.put_u32(0);
                buf.put_u16(0);
                HeaderMut::for_message_slice(&mut buf).bump_arcount();
            }
        }

        // The EDNS pseudo-record, always the last additional entry. A
        // plain query at the legacy size works without it.
        if bits.dnssec() || payload_size != LEGACY_SIZE {
            if buf.len() + 11 > limit {
                return Err(Error::InvalidQuery(
                    "message buffer exhausted".into(),
                ));
            }
            buf.put_u8(0); // root owner name
            buf.put_u16(TYPE_OPT);
            buf.put_u16(payload_size); // class carries the payload size
            buf.put_u8(0); // extended rcode
            buf.put_u8(0); // EDNS version
            buf.put_u16(if bits.dnssec() { OPT_DNSSEC_OK } else { 0 });
            buf.put_u16(0); // no options
            HeaderMut::for_message_slice(&mut buf).bump_arcount();
        }

        Ok(Query { buf })
    }

    /// Returns the wire form of the message.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the transaction id.
    pub fn id(&self) -> u16 {
        self.view().id()
    }

    /// Replaces the transaction id.
    ///
    /// Used when an operation has to re-enter the id registry and its old
    /// id has been taken in the meantime.
    pub(crate) fn set_id(&mut self, id: u16) {
        HeaderMut::for_message_slice(&mut self.buf).set_id(id)
    }

    /// Returns the opcode.
    pub fn opcode(&self) -> Opcode {
        self.view().opcode()
    }

    /// Returns the number of questions.
    pub fn questions(&self) -> u16 {
        self.view().qdcount()
    }

    /// Returns whether the query asks the given question.
    ///
    /// The name comparison is case-insensitive. Unparsable entries are
    /// skipped.
    pub fn contains(&self, question: &Question) -> bool {
        self.view()
            .questions()
            .flatten()
            .any(|own| own.matches(question))
    }

    /// Returns whether a received message answers this query.
    ///
    /// The id must match, the opcode must match, the question counts must
    /// match and every question of the response must appear in the query.
    /// Dynamic update messages carry no question section by protocol and
    /// match on id and opcode alone. A parse failure anywhere makes the
    /// message a non-match.
    pub fn matches(&self, response: &Response) -> bool {
        if response.id() != self.id() {
            return false;
        }
        if response.opcode() == Opcode::Update
            && self.opcode() == Opcode::Update
        {
            return true;
        }
        if response.opcode() != self.opcode() {
            return false;
        }
        if response.qdcount() != self.questions() {
            return false;
        }
        for question in response.questions() {
            match question {
                Ok(question) => {
                    if !self.contains(&question) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// Returns a response-style view over the own octets.
    fn view(&self) -> Response {
        Response::parse(&self.buf).expect("built messages parse")
    }
}

//============ Testing ======================================================
