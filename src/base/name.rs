//! Domain names on the wire.
//!
//! A domain name is encoded as a sequence of labels, each preceded by a
//! length octet, terminated by an empty label. A label is between 1 and 63
//! octets, the whole encoded name at most 255 octets. Instead of a label,
//! an encoder may place a pointer to an earlier occurrence of the remaining
//! suffix: two octets with the top two bits set and the target offset in
//! the lower fourteen bits (RFC 1035, section 4.1.4).
//!
//! This module provides the [`Compressor`] that writes names into an
//! outgoing message, reusing suffixes it has written before, and the
//! [`decompress`] function that reads a possibly compressed name back out
//! of a received message. Names are case-preserved on the wire and
//! compared case-insensitively via [`eq_ignore_case`].

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::ParseError;

/// Maximum length of a single label in octets.
const MAX_LABEL: usize = 63;

/// Maximum length of an encoded name in octets, length octets included.
const MAX_NAME: usize = 255;

/// Compression pointers can only address the first 16k of a message.
const MAX_POINTER: usize = 0x3fff;

//------------ NameError -----------------------------------------------------

/// An error happened while encoding a domain name.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum NameError {
    /// A label was empty or the name contained consecutive dots.
    #[error("empty label in domain name")]
    EmptyLabel,

    /// A label was longer than 63 octets.
    #[error("label exceeds 63 octets")]
    LongLabel,

    /// The encoded name would exceed 255 octets.
    #[error("domain name exceeds 255 octets")]
    LongName,

    /// The name did not fit into the remaining message space.
    #[error("message buffer exhausted")]
    Overflow,
}

//------------ Compressor ----------------------------------------------------

/// Writes domain names into a message, compressing repeated suffixes.
///
/// The compressor remembers the offset of every suffix it has written so
/// far. When asked to write a name whose tail it has seen before, it
/// writes the fresh labels and then a back-pointer instead of the tail.
/// Matching is case-insensitive, offsets beyond the 14-bit pointer range
/// are never recorded.
#[derive(Debug, Default)]
pub struct Compressor {
    /// Previously written suffixes and their offsets.
    seen: Vec<(String, u16)>,
}

impl Compressor {
    /// Creates a new compressor with an empty suffix table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the encoded form of `name` to `buf`.
    ///
    /// The buffer may not grow beyond `limit` octets. Returns the number
    /// of octets written.
    pub fn append(
        &mut self,
        name: &str,
        buf: &mut BytesMut,
        limit: usize,
    ) -> Result<usize, NameError> {
        let labels = split_labels(name)?;
        let start = buf.len();

        // The running wire length of what we encode for this name; used
        // against the 255 octet limit independently of compression.
        let mut wire_len = 1;
        for label in &labels {
            wire_len += label.len() + 1;
        }
        if wire_len > MAX_NAME {
            return Err(NameError::LongName);
        }

        for (i, label) in labels.iter().enumerate() {
            if let Some(target) = self.lookup(&labels[i..]) {
                if buf.len() + 2 > limit {
                    return Err(NameError::Overflow);
                }
                buf.put_u16(0xc000 | target);
                return Ok(buf.len() - start);
            }
            if buf.len() + label.len() + 1 > limit {
                return Err(NameError::Overflow);
            }
            self.record(&labels[i..], buf.len());
            buf.put_u8(label.len() as u8);
            buf.put_slice(label.as_bytes());
        }
        if buf.len() + 1 > limit {
            return Err(NameError::Overflow);
        }
        buf.put_u8(0);
        Ok(buf.len() - start)
    }

    /// Returns the recorded offset of an identical suffix, if any.
    fn lookup(&self, labels: &[&str]) -> Option<u16> {
        let key = join_lowercase(labels);
        self.seen
            .iter()
            .find(|(seen, _)| *seen == key)
            .map(|&(_, offset)| offset)
    }

    /// Records the offset of a freshly written suffix.
    fn record(&mut self, labels: &[&str], offset: usize) {
        if offset > MAX_POINTER {
            return;
        }
        let key = join_lowercase(labels);
        if self.seen.iter().any(|(seen, _)| *seen == key) {
            return;
        }
        self.seen.push((key, offset as u16));
    }
}

/// Splits a dotted name into labels, checking the label constraints.
///
/// A single trailing dot marks an absolute name and is ignored; the root
/// name (`""` or `"."`) yields no labels at all.
fn split_labels(name: &str) -> Result<Vec<&str>, NameError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return Ok(Vec::new());
    }
    let mut labels = Vec::new();
    for label in name.split('.') {
        if label.is_empty() {
            return Err(NameError::EmptyLabel);
        }
        if label.len() > MAX_LABEL {
            return Err(NameError::LongLabel);
        }
        labels.push(label);
    }
    Ok(labels)
}

/// Joins labels into the lowercase key used for suffix matching.
fn join_lowercase(labels: &[&str]) -> String {
    labels.join(".").to_ascii_lowercase()
}

//------------ Decompressed --------------------------------------------------

/// A domain name read out of a received message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Decompressed {
    /// The materialized dotted name, without a trailing dot. Root is the
    /// empty string.
    name: String,

    /// Octets consumed from the original position. Following pointers
    /// does not inflate this.
    consumed: usize,
}

impl Decompressed {
    /// Returns the dotted name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of octets the name occupied at its position.
    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

/// Reads a possibly compressed domain name starting at `start`.
///
/// Pointers may only point backwards: a pointer whose target is at or
/// beyond the offset of the pointer itself is rejected. Chains of
/// pointers therefore strictly decrease the read position, and any walk
/// through labels is capped by the 255 octet name limit, so decoding
/// always terminates.
pub fn decompress(
    packet: &[u8],
    start: usize,
) -> Result<Decompressed, ParseError> {
    let mut pos = start;
    let mut consumed = None;
    let mut name = String::new();
    let mut wire_len = 1usize;

    loop {
        let octet = *packet.get(pos).ok_or(ParseError::ShortBuf)?;
        match octet & 0xc0 {
            0x00 => {
                if octet == 0 {
                    if consumed.is_none() {
                        consumed = Some(pos + 1 - start);
                    }
                    return Ok(Decompressed {
                        name,
                        consumed: consumed.expect("just set"),
                    });
                }
                let len = octet as usize;
                let label = packet
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(ParseError::ShortBuf)?;
                wire_len += len + 1;
                if wire_len > MAX_NAME {
                    return Err(ParseError::LongName);
                }
                if !name.is_empty() {
                    name.push('.');
                }
                for &b in label {
                    name.push(char::from(b));
                }
                pos += len + 1;
            }
            0xc0 => {
                let low =
                    *packet.get(pos + 1).ok_or(ParseError::ShortBuf)?;
                let target =
                    usize::from(octet & 0x3f) << 8 | usize::from(low);
                // Forward pointers would allow unbounded lookahead.
                if target >= pos {
                    return Err(ParseError::BadPointer);
                }
                if consumed.is_none() {
                    consumed = Some(pos + 2 - start);
                }
                pos = target;
            }
            _ => return Err(ParseError::BadLabel),
        }
    }
}

//------------ Name helpers --------------------------------------------------

/// Returns the number of dots in a name, a trailing dot not counted.
///
/// This is the value the `ndots` option is compared against.
pub fn dots(name: &str) -> usize {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.chars().filter(|&c| c == '.').count()
}

/// Compares two dotted names for equality, ignoring case and a trailing
/// dot on either side.
pub fn eq_ignore_case(left: &str, right: &str) -> bool {
    let left = left.strip_suffix('.').unwrap_or(left);
    let right = right.strip_suffix('.').unwrap_or(right);
    left.eq_ignore_ascii_case(right)
}

//============ Testing ======================================================
