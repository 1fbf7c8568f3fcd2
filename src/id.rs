//! Circular identifier space.
//!
//! Identifiers are 160-bit unsigned integers interpreted as points on a ring of
//! size 2^160. All comparisons that matter for routing are circular:
//!
//! - **Distance**: [`Id::distance`] is the shorter of the clockwise and
//!   counterclockwise differences, so it is symmetric.
//! - **Direction**: [`Id::cw_distance`] measures the clockwise arc from one
//!   identifier to another; [`Id::clockwise`] tells which half of the ring a
//!   point lies in.
//! - **Digits**: prefix routing decomposes an identifier into `b`-bit digits.
//!   Digit `i` covers bits `[i*b, (i+1)*b)` counted from the least significant
//!   end, so digit `rows - 1` is the most significant one.
//!   [`Id::index_of_msdd`] returns the index of the most significant digit at
//!   which two identifiers differ.
//!
//! Identifiers for keys and nodes are usually derived with [`Id::from_key`],
//! which truncates a BLAKE3 digest to the identifier width.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use iroh_blake3::Hasher;
use rand::RngCore;

use crate::error::ParseIdError;

/// Width of the identifier space in bits.
pub const ID_BITS: usize = 160;

/// Width of the identifier space in bytes.
pub const ID_BYTES: usize = ID_BITS / 8;

/// A point on the identifier ring, stored big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id([u8; ID_BYTES]);

/// A non-negative distance between two identifiers.
///
/// Distances compare numerically; the derived ordering on the big-endian
/// byte array is exactly the numeric ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Debug)]
pub struct Distance([u8; ID_BYTES]);

/// Half of the ring, 2^159.
const HALF: Distance = {
    let mut bytes = [0u8; ID_BYTES];
    bytes[0] = 0x80;
    Distance(bytes)
};

impl Id {
    /// The identifier 0.
    pub const ZERO: Id = Id([0u8; ID_BYTES]);

    /// Build an identifier from its big-endian bytes.
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Build an identifier whose leading bytes are `prefix` and whose remaining
    /// bytes are zero. Extra prefix bytes are ignored.
    ///
    /// ```
    /// use pastry_overlay::Id;
    ///
    /// let id = Id::from_prefix(&[0x80]);
    /// assert_eq!(id.as_bytes()[0], 0x80);
    /// assert!(id.as_bytes()[1..].iter().all(|b| *b == 0));
    /// ```
    pub fn from_prefix(prefix: &[u8]) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        let len = prefix.len().min(ID_BYTES);
        bytes[..len].copy_from_slice(&prefix[..len]);
        Self(bytes)
    }

    /// Derive an identifier from arbitrary key material with BLAKE3.
    ///
    /// ```
    /// use pastry_overlay::Id;
    ///
    /// assert_eq!(Id::from_key(b"alpha"), Id::from_key(b"alpha"));
    /// assert_ne!(Id::from_key(b"alpha"), Id::from_key(b"beta"));
    /// ```
    pub fn from_key(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest.as_bytes()[..ID_BYTES]);
        Self(bytes)
    }

    /// Draw a uniformly random identifier.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Big-endian bytes of this identifier.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Full lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Clockwise arc length from `self` to `other`, i.e. `(other - self) mod 2^160`.
    pub fn cw_distance(&self, other: &Id) -> Distance {
        Distance(wrapping_sub(&other.0, &self.0))
    }

    /// Circular distance: the shorter of the two arcs between the identifiers.
    pub fn distance(&self, other: &Id) -> Distance {
        let cw = self.cw_distance(other);
        let ccw = other.cw_distance(self);
        cw.min(ccw)
    }

    /// Returns true if `other` lies in the clockwise half of the ring as seen
    /// from `self`, that is, the clockwise arc to it is shorter than half the
    /// ring.
    pub fn clockwise(&self, other: &Id) -> bool {
        self.cw_distance(other) < HALF
    }

    /// Returns true if `self` lies on the clockwise arc `[ccw, cw)`.
    ///
    /// The arc is empty when both bounds are equal.
    pub fn is_between(&self, ccw: &Id, cw: &Id) -> bool {
        if ccw == cw {
            return false;
        }
        ccw.cw_distance(self) < ccw.cw_distance(cw)
    }

    /// Extract the digit at `index` for digits of `base_bits` bits.
    ///
    /// Digit 0 is the least significant one.
    pub fn digit(&self, index: usize, base_bits: usize) -> usize {
        debug_assert!(base_bits > 0 && base_bits <= 8);
        let mut value = 0usize;
        for offset in (0..base_bits).rev() {
            let bit = index * base_bits + offset;
            value = (value << 1) | self.bit(bit) as usize;
        }
        value
    }

    /// Bit `index` counted from the least significant end.
    fn bit(&self, index: usize) -> u8 {
        debug_assert!(index < ID_BITS);
        let byte = self.0[ID_BYTES - 1 - index / 8];
        (byte >> (index % 8)) & 1
    }

    /// Index of the most significant `base_bits`-bit digit at which the two
    /// identifiers differ, or `None` when they are equal.
    ///
    /// ```
    /// use pastry_overlay::Id;
    ///
    /// let a = Id::from_prefix(&[0x12]);
    /// let b = Id::from_prefix(&[0x13]);
    /// // 160-bit ids with 4-bit digits have 40 digits; the second nibble is digit 38.
    /// assert_eq!(a.index_of_msdd(&b, 4), Some(38));
    /// assert_eq!(a.index_of_msdd(&a, 4), None);
    /// ```
    pub fn index_of_msdd(&self, other: &Id, base_bits: usize) -> Option<usize> {
        for (byte_idx, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                let leading = diff.leading_zeros() as usize;
                let bit_from_msb = byte_idx * 8 + leading;
                let bit_from_lsb = ID_BITS - 1 - bit_from_msb;
                return Some(bit_from_lsb / base_bits);
            }
        }
        None
    }

    /// Move clockwise by `distance`.
    pub fn add(&self, distance: &Distance) -> Id {
        Id(wrapping_add(&self.0, &distance.0))
    }

    /// Move counterclockwise by `distance`.
    pub fn sub(&self, distance: &Distance) -> Id {
        Id(wrapping_sub(&self.0, &distance.0))
    }

    /// The point halfway along the clockwise arc from `self` to `other`.
    pub fn cw_midpoint(&self, other: &Id) -> Id {
        self.add(&self.cw_distance(other).half())
    }
}

impl Distance {
    /// Zero distance.
    pub const ZERO: Distance = Distance([0u8; ID_BYTES]);

    /// Half of the ring; no circular distance exceeds it.
    pub const HALF: Distance = HALF;

    /// Big-endian bytes of the distance.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Returns true for the zero distance.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Halve the distance, rounding down.
    pub fn half(&self) -> Distance {
        let mut out = [0u8; ID_BYTES];
        let mut carry = 0u8;
        for (i, byte) in self.0.iter().enumerate() {
            out[i] = (byte >> 1) | (carry << 7);
            carry = byte & 1;
        }
        Distance(out)
    }
}

/// Order two candidates `a` and `b` by how close they are to `target`.
///
/// Returns [`Ordering::Less`] when `a` is closer. Equal distances are broken in
/// favour of the candidate lying clockwise of the target, so every node agrees
/// on a single root even when a target sits exactly between two identifiers.
pub fn closeness_cmp(target: &Id, a: &Id, b: &Id) -> Ordering {
    let da = target.distance(a);
    let db = target.distance(b);
    match da.cmp(&db) {
        Ordering::Equal if a != b => {
            let a_cw = target.cw_distance(a) <= a.cw_distance(target);
            let b_cw = target.cw_distance(b) <= b.cw_distance(target);
            match (a_cw, b_cw) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => Ordering::Equal,
            }
        }
        other => other,
    }
}

fn wrapping_sub(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    let mut borrow = 0i16;
    for i in (0..ID_BYTES).rev() {
        let mut v = a[i] as i16 - b[i] as i16 - borrow;
        if v < 0 {
            v += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out[i] = v as u8;
    }
    out
}

fn wrapping_add(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    let mut carry = 0u16;
    for i in (0..ID_BYTES).rev() {
        let v = a[i] as u16 + b[i] as u16 + carry;
        out[i] = (v & 0xff) as u8;
        carry = v >> 8;
    }
    out
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<0x{}..>", hex::encode(&self.0[..3]))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let decoded = hex::decode(trimmed)?;
        if decoded.len() != ID_BYTES {
            return Err(ParseIdError::Length(decoded.len()));
        }
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&decoded);
        Ok(Id(bytes))
    }
}

/// A contiguous clockwise arc of the ring, `[ccw, cw)`.
///
/// A range whose bounds coincide covers the whole ring unless it was built with
/// [`IdRange::empty`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    ccw: Id,
    cw: Id,
    empty: bool,
}

impl IdRange {
    /// The arc from `ccw` (inclusive) clockwise to `cw` (exclusive).
    pub fn new(ccw: Id, cw: Id) -> Self {
        Self {
            ccw,
            cw,
            empty: false,
        }
    }

    /// The whole ring.
    pub fn full() -> Self {
        Self::new(Id::ZERO, Id::ZERO)
    }

    /// A range containing nothing.
    pub fn empty() -> Self {
        Self {
            ccw: Id::ZERO,
            cw: Id::ZERO,
            empty: true,
        }
    }

    /// Inclusive counterclockwise bound.
    pub fn ccw(&self) -> Id {
        self.ccw
    }

    /// Exclusive clockwise bound.
    pub fn cw(&self) -> Id {
        self.cw
    }

    /// Returns true if the range contains nothing.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Returns true if the range covers the whole ring.
    pub fn is_full(&self) -> bool {
        !self.empty && self.ccw == self.cw
    }

    /// Returns true if `id` lies within the range.
    pub fn contains(&self, id: &Id) -> bool {
        if self.empty {
            return false;
        }
        if self.ccw == self.cw {
            return true;
        }
        id.is_between(&self.ccw, &self.cw)
    }

    /// Clockwise length of the range.
    pub fn size(&self) -> Distance {
        self.ccw.cw_distance(&self.cw)
    }

    /// Join two ranges that meet end to start (`self.cw == other.ccw`).
    ///
    /// Returns `None` when the ranges are not adjacent.
    pub fn merge(&self, other: &IdRange) -> Option<IdRange> {
        if self.empty {
            return Some(*other);
        }
        if other.empty {
            return Some(*self);
        }
        if self.cw == other.ccw {
            return Some(IdRange::new(self.ccw, other.cw));
        }
        if other.cw == self.ccw {
            return Some(IdRange::new(other.ccw, self.cw));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn distance_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let a = Id::random(&mut rng);
            let b = Id::random(&mut rng);
            assert_eq!(a.distance(&b), b.distance(&a));
            assert!(a.distance(&b) <= Distance::HALF);
        }
    }

    #[test]
    fn distance_wraps_around_zero() {
        let near_top = Id::from_bytes([0xff; ID_BYTES]);
        let zero = Id::ZERO;
        let mut one = [0u8; ID_BYTES];
        one[ID_BYTES - 1] = 1;
        assert_eq!(near_top.distance(&zero), Distance(one));
        assert_eq!(near_top.cw_distance(&zero), Distance(one));
        assert!(near_top.clockwise(&zero));
        assert!(!zero.clockwise(&near_top));
    }

    #[test]
    fn is_between_follows_clockwise_arc() {
        let a = Id::from_prefix(&[0x10]);
        let b = Id::from_prefix(&[0x30]);
        let inside = Id::from_prefix(&[0x20]);
        let outside = Id::from_prefix(&[0x40]);
        assert!(inside.is_between(&a, &b));
        assert!(a.is_between(&a, &b));
        assert!(!b.is_between(&a, &b));
        assert!(!outside.is_between(&a, &b));
        // the reversed arc wraps through zero
        assert!(outside.is_between(&b, &a));
        assert!(Id::ZERO.is_between(&b, &a));
        assert!(!inside.is_between(&a, &a));
    }

    #[test]
    fn digits_count_from_least_significant_end() {
        let id = Id::from_prefix(&[0xab, 0xcd]);
        assert_eq!(id.digit(39, 4), 0xa);
        assert_eq!(id.digit(38, 4), 0xb);
        assert_eq!(id.digit(37, 4), 0xc);
        assert_eq!(id.digit(19, 8), 0xab);
        assert_eq!(id.digit(0, 4), 0);
        assert_eq!(id.digit(159, 1), 1);
    }

    #[test]
    fn msdd_finds_highest_differing_digit() {
        let a = Id::ZERO;
        let b = Id::from_prefix(&[0x80]);
        assert_eq!(a.index_of_msdd(&b, 4), Some(39));
        assert_eq!(a.index_of_msdd(&b, 1), Some(159));

        let mut low = [0u8; ID_BYTES];
        low[ID_BYTES - 1] = 0x01;
        assert_eq!(a.index_of_msdd(&Id(low), 4), Some(0));
        assert_eq!(a.index_of_msdd(&a, 4), None);
    }

    #[test]
    fn closeness_ties_prefer_clockwise_candidate() {
        let target = Id::from_prefix(&[0x20]);
        let below = Id::from_prefix(&[0x10]);
        let above = Id::from_prefix(&[0x30]);
        assert_eq!(closeness_cmp(&target, &above, &below), Ordering::Less);
        assert_eq!(closeness_cmp(&target, &below, &above), Ordering::Greater);
        let nearer = Id::from_prefix(&[0x18]);
        assert_eq!(closeness_cmp(&target, &nearer, &above), Ordering::Less);
    }

    #[test]
    fn midpoint_and_ranges() {
        let a = Id::from_prefix(&[0xf0]);
        let b = Id::from_prefix(&[0x10]);
        assert_eq!(a.cw_midpoint(&b), Id::ZERO);

        let range = IdRange::new(a, b);
        assert!(range.contains(&Id::ZERO));
        assert!(!range.contains(&Id::from_prefix(&[0x80])));
        assert!(IdRange::full().contains(&Id::from_prefix(&[0x80])));
        assert!(!IdRange::empty().contains(&Id::ZERO));

        let next = IdRange::new(b, Id::from_prefix(&[0x20]));
        let merged = range.merge(&next).expect("adjacent ranges merge");
        assert_eq!(merged.ccw(), a);
        assert_eq!(merged.cw(), Id::from_prefix(&[0x20]));
    }

    #[test]
    fn hex_round_trip_through_from_str() {
        let id = Id::from_key(b"node");
        let parsed: Id = id.to_hex().parse().expect("valid hex");
        assert_eq!(parsed, id);
        assert!("abcd".parse::<Id>().is_err());
    }
}
