use std::fmt::{Display, Formatter};

/// Per-direction, monotonically increasing (mod 2^32) identifier for a reliable datagram.
///
/// Comparison uses wraparound-safe subtraction: `a` is before `b` iff `a - b < 0` in
///  wrapping arithmetic. This is deliberately *not* a total order - three numbers spaced
///  by more than half the number space can compare intransitively (a < b, b < c, c < a).
///  That is a documented, accepted limitation of the windowed protocol, which is why this
///  type does not implement `Ord`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNumber(i32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    pub fn plus(&self, offset: i32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(offset))
    }

    pub fn minus(&self, offset: i32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(offset))
    }

    /// The signed distance from `other` to `self` in wrapping arithmetic. Positive means
    ///  `self` is the younger number.
    pub fn offset_from(&self, other: SequenceNumber) -> i32 {
        self.0.wrapping_sub(other.0)
    }

    pub fn is_before(&self, other: SequenceNumber) -> bool {
        self.offset_from(other) < 0
    }

    pub fn is_at_or_before(&self, other: SequenceNumber) -> bool {
        self.offset_from(other) <= 0
    }
}
