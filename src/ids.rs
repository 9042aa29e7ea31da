use std::fmt::{Debug, Display, Formatter};

/// Identifies one route discovery round started by a node. Ids are allocated from a wrapping
///  counter, and ordering uses serial number arithmetic so that wraparound does not make a fresh
///  request look stale.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestId(u32);

impl Debug for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "REQ({})", self.0)
    }
}

impl RequestId {
    pub const ZERO: RequestId = RequestId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> RequestId {
        RequestId(self.0.wrapping_add(1))
    }

    pub fn is_newer_than(&self, other: RequestId) -> bool {
        serial_gt(self.0, other.0)
    }
}

/// Sequence number of a reliable socket's packets, both for the packets a socket sends and the
///  last packet it accepted from its peer.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SeqNum(u32);

impl Debug for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SEQ({})", self.0)
    }
}
impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn is_newer_than(&self, other: SeqNum) -> bool {
        serial_gt(self.0, other.0)
    }
}

fn serial_gt(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple(5, 6)]
    #[case::wrap(u32::MAX, 0)]
    fn test_next(#[case] raw: u32, #[case] expected: u32) {
        assert_eq!(SeqNum::from_raw(raw).next(), SeqNum::from_raw(expected));
        assert_eq!(RequestId::from_raw(raw).next(), RequestId::from_raw(expected));
    }

    #[rstest]
    #[case::equal(3, 3, false)]
    #[case::newer(4, 3, true)]
    #[case::older(3, 4, false)]
    #[case::newer_across_wrap(1, u32::MAX, true)]
    #[case::older_across_wrap(u32::MAX, 1, false)]
    #[case::far_apart(0x8000_0001, 0, false)]
    fn test_is_newer_than(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(SeqNum::from_raw(a).is_newer_than(SeqNum::from_raw(b)), expected);
        assert_eq!(RequestId::from_raw(a).is_newer_than(RequestId::from_raw(b)), expected);
    }
}
