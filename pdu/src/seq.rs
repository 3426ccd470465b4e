//! Sequence number arithmetic.
//!
//! The length of sequence numbers needs to be roughly
//!
//!   2^n > (2MPL + R + A) * T
//!
//! where
//!   MPL: Maximum PDU lifetime
//!   R: Maximum time for retries
//!   A: Maximum time before an ack is sent
//!   T: Data rate at which sequence numbers are incremented.
//!
//! A DIF picks 32 or 64 bit sequence numbers. Both wrap; ordering uses a
//! half-space comparison, so two numbers compare correctly as long as they
//! are less than half the space apart.

/// A sequence number as carried in the PCI.
pub type SeqNum = u64;

/// A modular sequence number space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SeqSpace {
    bits: u32,
}

impl Default for SeqSpace {
    fn default() -> Self {
        Self { bits: 64 }
    }
}

impl SeqSpace {
    /// Creates a space of `bits` bits.
    pub fn new(bits: u32) -> Self {
        assert!(bits > 0 && bits <= 64);
        Self { bits }
    }

    /// Number of bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    fn mask(&self) -> u64 {
        if self.bits == 64 {
            u64::max_value()
        } else {
            (1u64 << self.bits) - 1
        }
    }

    fn half(&self) -> u64 {
        1u64 << (self.bits - 1)
    }

    /// Reduces a number into the space.
    pub fn wrap(&self, n: u64) -> SeqNum {
        n & self.mask()
    }

    /// `a + n` modulo the space.
    pub fn add(&self, a: SeqNum, n: u64) -> SeqNum {
        self.wrap(a.wrapping_add(n))
    }

    /// Forward distance from `from` to `to`.
    pub fn distance(&self, from: SeqNum, to: SeqNum) -> u64 {
        self.wrap(to.wrapping_sub(from))
    }

    /// `a` precedes `b`.
    pub fn lt(&self, a: SeqNum, b: SeqNum) -> bool {
        let d = self.distance(a, b);
        d != 0 && d < self.half()
    }

    /// `a` precedes or equals `b`.
    pub fn le(&self, a: SeqNum, b: SeqNum) -> bool {
        a == b || self.lt(a, b)
    }

    /// `a` follows `b`.
    pub fn gt(&self, a: SeqNum, b: SeqNum) -> bool {
        self.lt(b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_32() {
        let s = SeqSpace::new(32);
        let max = u64::from(u32::max_value());
        assert_eq!(s.add(max, 1), 0);
        assert_eq!(s.add(max, 3), 2);
        assert_eq!(s.distance(max, 2), 3);
        assert!(s.lt(max, 2));
        assert!(s.gt(2, max));
        assert!(s.lt(1, 2));
        assert!(!s.lt(2, 2));
        assert!(s.le(2, 2));
    }

    #[test]
    fn test_space_64() {
        let s = SeqSpace::default();
        assert_eq!(s.add(u64::max_value(), 1), 0);
        assert!(s.lt(u64::max_value(), 0));
        assert!(!s.lt(0, 1 << 63));
        assert!(s.lt(0, (1 << 63) - 1));
    }
}
