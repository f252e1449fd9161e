//! Ring intervals over [`Id`]
//!
//! `IdRange` is the half-open ring interval `(from, to]`:
//! - `from < to`: plain interval
//! - `from > to`: wraps around the origin
//! - `from == to`: the whole ring

use crate::codec::{CodecError, Decode, Encode};
use crate::types::Id;
use bytes::{Bytes, BytesMut};
use std::ops::Bound;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IdRange {
    pub from: Id,
    pub to: Id,
}

/// One non-wrapping piece of an [`IdRange`], expressed as key bounds for an
/// ordered scan.
pub type ScanSegment = (Bound<Id>, Bound<Id>);

impl IdRange {
    pub fn new(from: Id, to: Id) -> Self {
        Self { from, to }
    }

    /// The whole ring.
    pub fn full() -> Self {
        Self { from: Id::MIN, to: Id::MIN }
    }

    pub fn is_full(&self) -> bool {
        self.from == self.to
    }

    /// True when the interval crosses the ring's origin.
    pub fn wraps(&self) -> bool {
        self.from > self.to
    }

    pub fn contains(&self, id: &Id) -> bool {
        if self.is_full() {
            true
        } else if self.wraps() {
            *id > self.from || *id <= self.to
        } else {
            *id > self.from && *id <= self.to
        }
    }

    /// Decompose into non-wrapping scan segments, in ring order starting
    /// after `from`.
    ///
    /// A wrapping range yields `(from, MAX]` followed by `[MIN, to]`.
    pub fn segments(&self) -> Vec<ScanSegment> {
        if self.is_full() {
            vec![(Bound::Unbounded, Bound::Unbounded)]
        } else if self.wraps() {
            vec![
                (Bound::Excluded(self.from), Bound::Unbounded),
                (Bound::Unbounded, Bound::Included(self.to)),
            ]
        } else {
            vec![(Bound::Excluded(self.from), Bound::Included(self.to))]
        }
    }

}

impl Encode for IdRange {
    fn encode(&self, buf: &mut BytesMut) {
        self.from.encode(buf);
        self.to.encode(buf);
    }
}

impl Decode for IdRange {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self { from: Id::decode(buf)?, to: Id::decode(buf)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> Id {
        Id([b; 32])
    }

    #[test]
    fn plain_range_is_open_closed() {
        let r = IdRange::new(id(10), id(20));
        assert!(!r.contains(&id(10)));
        assert!(r.contains(&id(11)));
        assert!(r.contains(&id(20)));
        assert!(!r.contains(&id(21)));
        assert!(!r.wraps());
    }

    #[test]
    fn wrapping_range_covers_origin() {
        let r = IdRange::new(id(200), id(5));
        assert!(r.wraps());
        assert!(r.contains(&id(201)));
        assert!(r.contains(&Id::MAX));
        assert!(r.contains(&Id::MIN));
        assert!(r.contains(&id(5)));
        assert!(!r.contains(&id(6)));
        assert!(!r.contains(&id(200)));
    }

    #[test]
    fn full_ring_contains_everything() {
        let r = IdRange::new(id(42), id(42));
        assert!(r.is_full());
        assert!(r.contains(&id(42)));
        assert!(r.contains(&Id::MIN));
        assert_eq!(r.segments(), vec![(Bound::Unbounded, Bound::Unbounded)]);
    }

}
