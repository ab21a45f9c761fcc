//! Header bits a query can carry.
//!
//! Queries sent by a stub carry a handful of header bits the caller may
//! want to influence:
//!
//! * RD: please recurse for me. On by default, a stub without recursion
//!   rarely gets an answer.
//! * AD: tell me whether the data was authenticated, in case you know.
//! * CD: checking disabled, hand over the data even if you could not
//!   verify it.
//! * DO: also send the relevant signature records (this one travels in
//!   the EDNS pseudo-record rather than the header proper).

//------------ Bits ----------------------------------------------------------

/// A packed set of the query-relevant header bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Bits(u8);

/// The AD bit.
const BIT_AD: u8 = 0x01;

/// The CD bit.
const BIT_CD: u8 = 0x02;

/// The DO bit.
const BIT_DO: u8 = 0x04;

/// The RD bit.
const BIT_RD: u8 = 0x08;

impl Bits {
    /// Creates an empty set. Note that this clears RD as well.
    pub fn empty() -> Self {
        Bits(0)
    }

    /// Returns whether the AD bit is in the set.
    pub fn ad(self) -> bool {
        self.0 & BIT_AD != 0
    }

    /// Returns whether the CD bit is in the set.
    pub fn cd(self) -> bool {
        self.0 & BIT_CD != 0
    }

    /// Returns whether the DO bit is in the set.
    pub fn dnssec(self) -> bool {
        self.0 & BIT_DO != 0
    }

    /// Returns whether the RD bit is in the set.
    pub fn rd(self) -> bool {
        self.0 & BIT_RD != 0
    }

    /// Adds or removes the AD bit.
    pub fn set_ad(&mut self, value: bool) {
        self.apply(BIT_AD, value)
    }

    /// Adds or removes the CD bit.
    pub fn set_cd(&mut self, value: bool) {
        self.apply(BIT_CD, value)
    }

    /// Adds or removes the DO bit.
    pub fn set_dnssec(&mut self, value: bool) {
        self.apply(BIT_DO, value)
    }

    /// Adds or removes the RD bit.
    pub fn set_rd(&mut self, value: bool) {
        self.apply(BIT_RD, value)
    }

    /// Returns the set with the AD bit added.
    pub fn with_ad(mut self) -> Self {
        self.set_ad(true);
        self
    }

    /// Returns the set with the CD bit added.
    pub fn with_cd(mut self) -> Self {
        self.set_cd(true);
        self
    }

    /// Returns the set with the DO bit added.
    pub fn with_dnssec(mut self) -> Self {
        self.set_dnssec(true);
        self
    }

    /// Adds or removes a bit.
    fn apply(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit
        } else {
            self.0 &= !bit
        }
    }
}

impl Default for Bits {
    /// The default set carries RD only.
    fn default() -> Self {
        Bits(BIT_RD)
    }
}

//============ Testing ======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_and_composition() {
        let bits = Bits::default();
        assert!(bits.rd());
        assert!(!bits.ad() && !bits.cd() && !bits.dnssec());

        let bits = Bits::default().with_dnssec().with_cd();
        assert!(bits.rd() && bits.cd() && bits.dnssec());

        let mut bits = Bits::empty();
        assert!(!bits.rd());
        bits.set_ad(true);
        bits.set_ad(false);
        assert_eq!(bits, Bits::empty());
    }
}
